//! Realtime Sync (C7): per-chain tip follower. Polls for new heads, detects
//! reorgs via a binary search over a small in-memory window of recent block
//! hashes (the same search shape as the teacher's `detect_reorg_start`, here
//! run against an in-process cache instead of a database scan), and raises
//! finality as the chain advances.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::NetworkConfig;
use crate::filter::{self, LogFilter};
use crate::local::{block_head_from_value, BlockHead};
use crate::logs;
use crate::rpc::RpcClient;
use crate::store::{self, BlockRow, Db, LogRow};
use crate::timestamps;

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Block(BlockHead),
    Reorg(BlockHead),
    Finalize(BlockHead),
}

pub struct RealtimeSync {
    network: NetworkConfig,
    rpc: RpcClient,
    db: Db,
    log_filters: Vec<LogFilter>,
    /// Ascending by block number; covers `[finalized.number, tip.number]`.
    cache: Vec<BlockHead>,
    tip: BlockHead,
    finalized: BlockHead,
    shutdown: CancellationToken,
}

impl RealtimeSync {
    pub fn new(
        network: NetworkConfig,
        rpc: RpcClient,
        db: Db,
        log_filters: Vec<LogFilter>,
        tip: BlockHead,
        finalized: BlockHead,
        shutdown: CancellationToken,
    ) -> Self {
        Self { network, rpc, db, log_filters, cache: vec![tip.clone()], tip, finalized, shutdown }
    }

    pub fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    pub fn kill(&self) {
        self.shutdown.cancel();
    }

    /// Sleeps one poll interval (or returns immediately if killed), then
    /// fetches the current head and returns whatever `block`/`reorg`/
    /// `finalize` events resulted, in strict emission order.
    pub async fn poll(&mut self) -> Result<Vec<RealtimeEvent>> {
        tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(Vec::new()),
            _ = tokio::time::sleep(Duration::from_millis(self.network.poll_interval_ms)) => {}
        }
        if self.shutdown.is_cancelled() {
            return Ok(Vec::new());
        }

        let head_number = self.rpc.block_number().await.context("eth_blockNumber")?;
        if head_number <= self.tip.number {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let head_block = self.fetch_and_store(head_number).await?;

        if head_number == self.tip.number + 1 && head_block.parent_hash == self.tip.hash {
            self.push_block(head_block.clone());
            events.push(RealtimeEvent::Block(head_block));
        } else {
            // Either the head isn't a direct successor of our tip, or it is
            // but doesn't chain to it: walk back to find the common ancestor.
            let ancestor = self.find_fork_point().await?;
            if ancestor.number < self.tip.number {
                self.apply_reorg(ancestor, head_number, &mut events).await?;
            } else {
                // No divergence, just a gap (slow poll, RPC burst, fast blocks).
                self.extend_to(head_number, &mut events).await?;
            }
        }

        self.check_finality(&mut events).await?;
        Ok(events)
    }

    async fn extend_to(&mut self, head_number: u64, events: &mut Vec<RealtimeEvent>) -> Result<()> {
        for n in (self.tip.number + 1)..head_number {
            let b = self.fetch_and_store(n).await?;
            self.push_block(b.clone());
            events.push(RealtimeEvent::Block(b));
        }
        let head = self.fetch_and_store(head_number).await?;
        self.push_block(head.clone());
        events.push(RealtimeEvent::Block(head));
        Ok(())
    }

    async fn apply_reorg(&mut self, ancestor: BlockHead, head_number: u64, events: &mut Vec<RealtimeEvent>) -> Result<()> {
        self.cache.retain(|b| b.number <= ancestor.number);
        self.tip = ancestor.clone();
        events.push(RealtimeEvent::Reorg(ancestor));
        self.extend_to(head_number, events).await
    }

    fn push_block(&mut self, head: BlockHead) {
        self.tip = head.clone();
        self.cache.push(head);
    }

    /// Binary search over the cached window for the highest block whose
    /// cached hash the RPC still confirms; its successor is the fork point.
    /// Fatal if even the finalized boundary no longer matches.
    async fn find_fork_point(&self) -> Result<BlockHead> {
        let known = &self.cache;
        if known.is_empty() {
            anyhow::bail!("chain {}: no cached blocks to reorg-search against", self.network.chain_id);
        }

        let mut left = 0usize;
        let mut right = known.len();
        while left < right {
            let mid = (left + right) / 2;
            let candidate = &known[mid];
            let block = self
                .rpc
                .get_block_by_number(candidate.number, false)
                .await
                .with_context(|| format!("eth_getBlockByNumber({})", candidate.number))?
                .with_context(|| format!("block {} disappeared mid-reorg-scan", candidate.number))?;
            let rpc_hash = timestamps::parse_block_hash(&block)?;
            if rpc_hash == candidate.hash {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left == 0 {
            return Err(crate::error::SyncError::DataInvariant(anyhow::anyhow!(
                "chain {}: reorg walked back past the finalized boundary (block {})",
                self.network.chain_id,
                self.finalized.number
            ))
            .into());
        }
        Ok(known[left - 1].clone())
    }

    async fn check_finality(&mut self, events: &mut Vec<RealtimeEvent>) -> Result<()> {
        let finalized_number = self.tip.number.saturating_sub(self.network.finality_depth);
        if finalized_number <= self.finalized.number {
            return Ok(());
        }
        let finalized_block = match self.cache.iter().rev().find(|b| b.number == finalized_number) {
            Some(b) => b.clone(),
            None => self.fetch_and_store(finalized_number).await?,
        };
        self.finalized = finalized_block.clone();
        self.cache.retain(|b| b.number >= finalized_number);
        events.push(RealtimeEvent::Finalize(finalized_block));
        Ok(())
    }

    /// Fetches block `number`, persists it, and eagerly fetches/persists any
    /// logs matching this chain's log filters (after a bloom pre-filter) so
    /// the coordinator's `populateEvents([n, n])` step has raw data ready.
    async fn fetch_and_store(&self, number: u64) -> Result<BlockHead> {
        let value = self
            .rpc
            .get_block_by_number(number, false)
            .await?
            .with_context(|| format!("block {number} not found"))?;
        let head = block_head_from_value(&value)?;

        store::insert_blocks(
            &self.db,
            &[BlockRow {
                chain_id: self.network.chain_id,
                hash: head.hash.clone(),
                number: head.number,
                timestamp: head.timestamp,
                parent_hash: head.parent_hash.clone(),
                body: value.clone(),
            }],
        )
        .await?;

        if let Some(bloom) = parse_bloom(&value)? {
            let matching: Vec<&LogFilter> = self
                .log_filters
                .iter()
                .filter(|f| filter::log_filter_might_match_bloom(&bloom, f))
                .collect();
            for f in matching {
                if let Err(e) = self.fetch_and_store_logs(f, number).await {
                    warn!(chain_id = self.network.chain_id, block = number, err = %e, "realtime log fetch failed for block");
                    return Err(e);
                }
            }
        }

        Ok(head)
    }

    async fn fetch_and_store_logs(&self, f: &LogFilter, number: u64) -> Result<()> {
        if matches!(f.address, Some(crate::filter::AddressConstraint::Child(_))) {
            // Child-address resolution only happens during historical sync; realtime
            // catches those events up on the next historical pass instead.
            return Ok(());
        }
        let mut rpc_filter = serde_json::json!({
            "fromBlock": crate::rpc::format_quantity(number),
            "toBlock": crate::rpc::format_quantity(number),
        });
        if let Some(address) = &f.address {
            rpc_filter["address"] = match address {
                crate::filter::AddressConstraint::Single(a) => serde_json::json!(a.to_lowercase()),
                crate::filter::AddressConstraint::Set(v) => {
                    serde_json::json!(v.iter().map(|a| a.to_lowercase()).collect::<Vec<_>>())
                }
                crate::filter::AddressConstraint::Child(_) => unreachable!(),
            };
        }

        let raw_logs = self.rpc.get_logs(rpc_filter).await.context("eth_getLogs (realtime)")?;
        if raw_logs.is_empty() {
            return Ok(());
        }
        let validated = logs::validate_and_sort_logs(raw_logs)?;
        let rows: Vec<LogRow> = validated
            .iter()
            .map(|v| {
                let topics = v.log.topics();
                LogRow {
                    chain_id: self.network.chain_id,
                    block_hash: format!("{:#x}", v.block_hash),
                    log_index: v.log_index,
                    block_number: v.block_number,
                    transaction_hash: format!("{:#x}", v.tx_hash),
                    transaction_index: v.log.transaction_index.unwrap_or_default(),
                    address: format!("{:#x}", v.log.address()),
                    topics: [
                        topics.first().map(|t| format!("{t:#x}")),
                        topics.get(1).map(|t| format!("{t:#x}")),
                        topics.get(2).map(|t| format!("{t:#x}")),
                        topics.get(3).map(|t| format!("{t:#x}")),
                    ],
                    data: format!("0x{}", hex::encode(v.log.data().as_ref())),
                    body: serde_json::to_value(&v.log).unwrap_or(Value::Null),
                }
            })
            .collect();
        store::insert_logs(&self.db, &rows).await
    }
}

fn parse_bloom(v: &Value) -> Result<Option<alloy::primitives::Bloom>> {
    let Some(raw) = v.get("logsBloom").and_then(|x| x.as_str()) else { return Ok(None) };
    Ok(Some(raw.parse().context("parse logsBloom")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(number: u64, hash: &str, parent: &str) -> BlockHead {
        BlockHead { number, hash: hash.to_string(), timestamp: number, parent_hash: parent.to_string() }
    }

    #[test]
    fn block_head_from_value_parses_fields() {
        let v = serde_json::json!({
            "number": "0x5",
            "hash": "0xAA",
            "timestamp": "0x1",
            "parentHash": "0xBB",
        });
        let h = block_head_from_value(&v).unwrap();
        assert_eq!(h.number, 5);
        assert_eq!(h.hash, "0xaa");
    }

    #[test]
    fn cache_helpers_track_tip() {
        let mut cache = vec![head(1, "0x1", "0x0")];
        cache.push(head(2, "0x2", "0x1"));
        assert_eq!(cache.last().unwrap().number, 2);
    }
}
