//! Local Sync (C6): per-chain pacer that walks a cursor forward through
//! history in bounded steps so downstream consumers see events quickly,
//! deferring to the teacher's chunked-fetch idiom (`runner.rs`'s range loop)
//! one level up from `historical.rs`.

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::NetworkConfig;
use crate::filter::Filter;
use crate::historical::HistoricalSync;
use crate::rpc::{self, RpcClient};
use crate::store::Db;
use crate::timestamps;

#[derive(Debug, Clone)]
pub struct BlockHead {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub parent_hash: String,
}

pub(crate) fn block_head_from_value(v: &Value) -> Result<BlockHead> {
    let hash = timestamps::parse_block_hash(v)?;
    let timestamp = timestamps::parse_block_timestamp(v)?;
    let number = rpc::parse_quantity_u64(v.get("number").cloned().context("missing block.number")?)
        .context("parse block.number")?;
    let parent_hash = v
        .get("parentHash")
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_lowercase();
    Ok(BlockHead { number, hash, timestamp, parent_hash })
}

pub struct LocalSync {
    pub network: NetworkConfig,
    rpc: RpcClient,
    db: Db,
    historical: Vec<HistoricalSync>,
    pub start_head: BlockHead,
    pub start_block: u64,
    pub end_block: Option<BlockHead>,
    pub finalized_block: BlockHead,
    pub from_block: u64,
    historical_latest: Option<BlockHead>,
    realtime_override: Option<BlockHead>,
    blocks_per_event: f64,
}

impl LocalSync {
    pub async fn new(
        network: NetworkConfig,
        rpc: RpcClient,
        db: Db,
        filters: &[Filter],
        base_blocks_per_event: f64,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        anyhow::ensure!(!filters.is_empty(), "chain {} has no sources", network.chain_id);
        let blocks_per_event = base_blocks_per_event / filters.len() as f64;

        let start_block = filters.iter().map(Filter::from_block).min().unwrap_or(0);
        let any_open_ended = filters.iter().any(|f| f.to_block().is_none());
        let max_to_block = filters.iter().filter_map(Filter::to_block).max();

        let (chain_id, start_head, end_head, latest_head) = tokio::try_join!(
            rpc.chain_id(),
            fetch_head(&rpc, start_block),
            async {
                let result: Result<Option<BlockHead>> = if any_open_ended {
                    Ok(None)
                } else {
                    let to = max_to_block.expect("closed filters always have a to_block");
                    Ok(Some(fetch_head(&rpc, to).await?))
                };
                result
            },
            fetch_latest_head(&rpc),
        )?;

        if chain_id != network.chain_id {
            warn!(configured = network.chain_id, reported = chain_id, "RPC endpoint reports a different chain id than configured");
        }
        let finalized_number = latest_head.number.saturating_sub(network.finality_depth);
        let finalized_block = fetch_head(&rpc, finalized_number).await?;

        let historical = filters
            .iter()
            .cloned()
            .map(|f| HistoricalSync::new(network.clone(), rpc.clone(), db.clone(), f, shutdown.clone()))
            .collect();

        Ok(Self {
            network,
            rpc,
            db,
            historical,
            start_head,
            start_block,
            end_block: end_head,
            finalized_block,
            from_block: start_block,
            historical_latest: None,
            realtime_override: None,
            blocks_per_event,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// `latestBlock` getter: realtime override, then end-of-range, then
    /// finality ceiling, then whatever historical sync has actually ingested.
    pub fn latest_block(&self) -> Option<&BlockHead> {
        if let Some(b) = &self.realtime_override {
            return Some(b);
        }
        if let Some(end) = &self.end_block {
            if self.from_block >= end.number {
                return Some(end);
            }
        }
        if self.from_block >= self.finalized_block.number {
            return Some(&self.finalized_block);
        }
        self.historical_latest.as_ref()
    }

    pub fn set_realtime_override(&mut self, head: Option<BlockHead>) {
        self.realtime_override = head;
    }

    pub fn set_finalized(&mut self, head: BlockHead) {
        self.finalized_block = head;
    }

    pub fn is_complete(&self) -> bool {
        self.end_block.as_ref().is_some_and(|end| self.finalized_block.number >= end.number)
    }

    /// Advances `from_block` by a bounded step and syncs every source over it.
    /// Bounding the step keeps time-to-first-event low instead of letting one
    /// chain's historical backlog starve the others.
    pub async fn sync(&mut self) -> Result<u64> {
        if self.from_block > self.finalized_block.number {
            return Ok(0);
        }
        let step = ((self.blocks_per_event * 1000.0).max(1.0)) as u64;
        let hi = self.finalized_block.number.min(self.from_block.saturating_add(step.saturating_sub(1)));
        let lo = self.from_block;
        if lo > hi {
            return Ok(0);
        }
        self.from_block = hi.saturating_add(1);

        let mut total = 0u64;
        for h in &mut self.historical {
            total += h.sync((lo, hi)).await?;
        }

        if let Some(head) = crate::store::get_block_by_number(&self.db, self.network.chain_id, hi).await? {
            self.historical_latest = Some(BlockHead {
                number: head.number,
                hash: head.hash,
                timestamp: head.timestamp,
                parent_hash: head.parent_hash,
            });
        }

        Ok(total)
    }
}

async fn fetch_head(rpc: &RpcClient, number: u64) -> Result<BlockHead> {
    let block = rpc
        .get_block_by_number(number, false)
        .await?
        .with_context(|| format!("block {number} not found"))?;
    block_head_from_value(&block)
}

async fn fetch_latest_head(rpc: &RpcClient) -> Result<BlockHead> {
    let number = rpc.block_number().await.context("eth_blockNumber")?;
    fetch_head(rpc, number).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_head_parses_number_and_hash() {
        let v = serde_json::json!({
            "number": "0x10",
            "hash": "0xAB",
            "timestamp": "0x5",
            "parentHash": "0xCD",
        });
        let head = block_head_from_value(&v).unwrap();
        assert_eq!(head.number, 16);
        assert_eq!(head.hash, "0xab");
        assert_eq!(head.parent_hash, "0xcd");
    }
}
