//! Historical Sync (C5): fetches and materializes everything a filter has
//! missed, chunked and retried the way the teacher's `runner.rs` drives its
//! single-contract range loop, generalized to arbitrary filters and to the
//! child-address (factory) case.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::filter::{
    AddressConstraint, ChildAddressFilter, ChildAddressLocation, Filter, FilterKind, LogFilter,
};
use crate::interval::{self, BlockRange};
use crate::logs::{self, ValidatedLog};
use crate::rpc::{self, RpcClient};
use crate::store::{self, BlockRow, Db, LogRow};
use crate::timestamps::{self, TimestampCache};

pub struct HistoricalSync {
    network: NetworkConfig,
    rpc: RpcClient,
    db: Db,
    filter: Filter,
    filter_id: String,
    chunk_target: u64,
    chunk_current: u64,
    timestamps: TimestampCache,
    shutdown: CancellationToken,
}

impl HistoricalSync {
    pub fn new(network: NetworkConfig, rpc: RpcClient, db: Db, filter: Filter, shutdown: CancellationToken) -> Self {
        let filter_id = crate::filter::filter_id(FilterKind::Event, &filter);
        let chunk_target = network.chunk_blocks.max(1);
        Self {
            network,
            rpc,
            db,
            filter,
            filter_id,
            chunk_target,
            chunk_current: chunk_target,
            timestamps: TimestampCache::new(8192),
            shutdown,
        }
    }

    fn chain_id(&self) -> u64 {
        self.filter.chain_id()
    }

    /// Syncs every block in `requested` that hasn't already been covered,
    /// materializing matched events as it goes. Returns the number of newly
    /// inserted event rows.
    pub async fn sync(&mut self, requested: BlockRange) -> Result<u64> {
        let lo = requested.0.max(self.filter.from_block());
        let hi = self.filter.to_block().map(|t| requested.1.min(t)).unwrap_or(requested.1);
        if lo > hi {
            return Ok(0);
        }

        let existing = store::get_intervals(&self.db, FilterKind::Event.as_str(), self.chain_id(), &self.filter_id)
            .await
            .context("read existing event intervals")?;
        let missing = interval::difference(&[(lo, hi)], &existing);

        let mut total = 0u64;
        for (lo, hi) in missing {
            total += self.sync_range(lo, hi).await?;
        }
        Ok(total)
    }

    async fn sync_range(&mut self, lo: u64, hi: u64) -> Result<u64> {
        let mut from = lo;
        let mut inserted_total = 0u64;
        let mut transient_attempts = 0u32;
        let mut transient_backoff = Duration::from_millis(250);

        while from <= hi {
            if self.shutdown.is_cancelled() {
                break;
            }
            let to = hi.min(from.saturating_add(self.chunk_current.saturating_sub(1)));

            match self.sync_chunk(from, to).await {
                Ok(n) => {
                    store::insert_interval(&self.db, FilterKind::Event.as_str(), self.chain_id(), &self.filter_id, (from, to))
                        .await
                        .context("record synced interval")?;
                    inserted_total += n;
                    from = to.saturating_add(1);
                    transient_attempts = 0;
                    transient_backoff = Duration::from_millis(250);
                    self.chunk_current = grow_chunk(self.chunk_current, self.chunk_target);
                }
                Err(e) => {
                    if rpc::looks_like_transient(&e) && transient_attempts < 5 {
                        transient_attempts += 1;
                        warn!(chain_id = self.chain_id(), from, to, attempt = transient_attempts, err = %e, "transient error; retrying range");
                        tokio::time::sleep(transient_backoff).await;
                        transient_backoff = (transient_backoff * 2).min(Duration::from_secs(2));
                        continue;
                    }
                    if self.chunk_current > 1 && rpc::looks_like_range_too_large(&e) {
                        self.chunk_current = shrink_chunk(self.chunk_current);
                        warn!(chain_id = self.chain_id(), from, to, chunk_blocks = self.chunk_current, err = %e, "range too large; shrinking chunk");
                        transient_attempts = 0;
                        transient_backoff = Duration::from_millis(250);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Ok(inserted_total)
    }

    async fn sync_chunk(&mut self, from: u64, to: u64) -> Result<u64> {
        match self.filter.clone() {
            Filter::Log(f) => self.sync_log_chunk(&f, from, to).await,
            Filter::Block(_) => self.sync_block_chunk(from, to).await,
        }
    }

    async fn sync_log_chunk(&mut self, f: &LogFilter, from: u64, to: u64) -> Result<u64> {
        let address_json = match &f.address {
            None => None,
            Some(AddressConstraint::Single(a)) => Some(serde_json::json!(a.to_lowercase())),
            Some(AddressConstraint::Set(addrs)) => {
                let lowered: Vec<String> = addrs.iter().map(|a| a.to_lowercase()).collect();
                Some(serde_json::json!(lowered))
            }
            Some(AddressConstraint::Child(child)) => {
                self.sync_address(child, from, to).await.context("resolve child addresses")?;
                let resolved = store::get_addresses(
                    &self.db,
                    self.chain_id(),
                    &crate::filter::filter_id(FilterKind::Address, &child.discovery_filter(0, None)),
                )
                .await?;
                if resolved.is_empty() {
                    return Ok(0);
                }
                Some(serde_json::json!(resolved))
            }
        };

        let mut topics_json = Vec::with_capacity(4);
        for t in &f.topics {
            topics_json.push(match t {
                None => serde_json::Value::Null,
                Some(crate::filter::TopicConstraint::Single(s)) => serde_json::json!(s.to_lowercase()),
                Some(crate::filter::TopicConstraint::Set(v)) => {
                    serde_json::json!(v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>())
                }
            });
        }
        while topics_json.last() == Some(&serde_json::Value::Null) {
            topics_json.pop();
        }

        let mut rpc_filter = serde_json::json!({
            "fromBlock": rpc::format_quantity(from),
            "toBlock": rpc::format_quantity(to),
            "topics": topics_json,
        });
        if let Some(address) = address_json {
            rpc_filter["address"] = address;
        }

        let raw_logs = self.rpc.get_logs(rpc_filter).await.context("eth_getLogs")?;
        if raw_logs.is_empty() {
            return Ok(0);
        }
        let validated = logs::validate_and_sort_logs(raw_logs).context("validate eth_getLogs response")?;

        let block_numbers: Vec<u64> = validated.iter().map(|l| l.block_number).collect();
        self.ensure_blocks(&block_numbers).await?;

        let mut log_rows = Vec::with_capacity(validated.len());
        for ValidatedLog { log, block_number, block_hash, tx_hash, log_index } in &validated {
            let body = serde_json::to_value(log).context("serialize log")?;
            let topics = log.topics();
            log_rows.push(LogRow {
                chain_id: self.chain_id(),
                block_hash: format!("{block_hash:#x}"),
                log_index: *log_index,
                block_number: *block_number,
                transaction_hash: format!("{tx_hash:#x}"),
                transaction_index: log.transaction_index.unwrap_or_default(),
                address: format!("{:#x}", log.address()),
                topics: [
                    topics.first().map(|t| format!("{t:#x}")),
                    topics.get(1).map(|t| format!("{t:#x}")),
                    topics.get(2).map(|t| format!("{t:#x}")),
                    topics.get(3).map(|t| format!("{t:#x}")),
                ],
                data: format!("0x{}", hex::encode(log.data().as_ref())),
                body,
            });
        }
        store::insert_logs(&self.db, &log_rows).await.context("insert sync.log")?;

        let inserted = store::populate_events(&self.db, &self.filter_id, &self.filter, (from, to))
            .await
            .context("populate sync.event from logs")?;

        info!(chain_id = self.chain_id(), filter_id = %self.filter_id, from, to, logs = log_rows.len(), inserted, "historical range synced");
        Ok(inserted)
    }

    async fn sync_block_chunk(&mut self, from: u64, to: u64) -> Result<u64> {
        let numbers: Vec<u64> = (from..=to).collect();
        self.ensure_blocks(&numbers).await?;
        let inserted = store::populate_events(&self.db, &self.filter_id, &self.filter, (from, to))
            .await
            .context("populate sync.event from blocks")?;
        Ok(inserted)
    }

    /// Resolves child addresses emitted by `child`'s discovery events in
    /// `[from, to]`, caching progress under its own address-kind interval so
    /// repeated syncs don't re-scan the same discovery range.
    async fn sync_address(&mut self, child: &ChildAddressFilter, from: u64, to: u64) -> Result<()> {
        let discovery_filter = child.discovery_filter(0, None);
        let discovery_filter_id = crate::filter::filter_id(FilterKind::Address, &discovery_filter);

        let existing = store::get_intervals(&self.db, FilterKind::Address.as_str(), child.chain_id, &discovery_filter_id).await?;
        let missing = interval::difference(&[(from, to)], &existing);
        if missing.is_empty() {
            return Ok(());
        }

        let parent_address = match &child.address {
            AddressConstraint::Single(a) => serde_json::json!(a.to_lowercase()),
            AddressConstraint::Set(addrs) => {
                serde_json::json!(addrs.iter().map(|a| a.to_lowercase()).collect::<Vec<_>>())
            }
            AddressConstraint::Child(_) => anyhow::bail!("nested child-address filters are not supported"),
        };

        for (lo, hi) in missing {
            let rpc_filter = serde_json::json!({
                "address": parent_address,
                "fromBlock": rpc::format_quantity(lo),
                "toBlock": rpc::format_quantity(hi),
                "topics": [child.event_selector.to_lowercase()],
            });
            let raw_logs = self.rpc.get_logs(rpc_filter).await.context("eth_getLogs (child-address discovery)")?;
            let validated = logs::validate_and_sort_logs(raw_logs).context("validate discovery logs")?;

            let mut addresses = Vec::with_capacity(validated.len());
            for v in &validated {
                if let Some(addr) = extract_child_address(&v.log, &child.location) {
                    addresses.push((addr, v.block_number));
                }
            }
            store::insert_addresses(&self.db, child.chain_id, &discovery_filter_id, &addresses).await?;
            store::insert_interval(&self.db, FilterKind::Address.as_str(), child.chain_id, &discovery_filter_id, (lo, hi)).await?;
        }
        Ok(())
    }

    /// Fetches and persists any of `numbers` not already in the timestamp
    /// cache, with the same bounded-concurrency fan-out `timestamps.rs` uses.
    async fn ensure_blocks(&mut self, numbers: &[u64]) -> Result<HashMap<u64, u64>> {
        let mut unique: Vec<u64> = numbers.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let missing: Vec<u64> = unique.iter().copied().filter(|n| self.timestamps.get(*n).is_none()).collect();

        if !missing.is_empty() {
            let rpc = self.rpc.clone();
            let concurrency = self.network.chunk_blocks.clamp(1, 32) as usize;
            let mut tasks = stream::iter(missing.into_iter())
                .map(move |n| {
                    let rpc = rpc.clone();
                    async move {
                        let block = rpc.get_block_by_number(n, false).await?;
                        Ok::<_, anyhow::Error>(block.map(|b| (n, b)))
                    }
                })
                .buffer_unordered(concurrency);

            let mut rows = Vec::new();
            while let Some(res) = tasks.next().await {
                if let Some((number, block)) = res? {
                    let hash = timestamps::parse_block_hash(&block)?;
                    let ts = timestamps::parse_block_timestamp(&block)?;
                    let parent_hash = block
                        .get("parentHash")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_lowercase();
                    self.timestamps.insert(number, ts);
                    rows.push(BlockRow {
                        chain_id: self.chain_id(),
                        hash,
                        number,
                        timestamp: ts,
                        parent_hash,
                        body: block,
                    });
                }
            }
            store::insert_blocks(&self.db, &rows).await?;
        }

        Ok(unique.into_iter().filter_map(|n| self.timestamps.get(n).map(|ts| (n, ts))).collect())
    }
}

fn grow_chunk(current: u64, target: u64) -> u64 {
    if current >= target {
        return current;
    }
    current.saturating_mul(2).min(target)
}

fn shrink_chunk(current: u64) -> u64 {
    (current / 2).max(1)
}

fn extract_child_address(log: &alloy::rpc::types::Log, location: &ChildAddressLocation) -> Option<String> {
    match location {
        ChildAddressLocation::Topic { n } => {
            let idx = *n as usize;
            let topic = log.topics().get(idx)?;
            Some(format!("0x{}", hex::encode(&topic.as_slice()[12..])))
        }
        ChildAddressLocation::Offset { k } => {
            let data = log.data().as_ref();
            let start = (*k as usize).checked_mul(32)?;
            let word = data.get(start..start + 32)?;
            Some(format!("0x{}", hex::encode(&word[12..])))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_chunk_doubles_until_target() {
        assert_eq!(grow_chunk(10, 100), 20);
        assert_eq!(grow_chunk(80, 100), 100);
        assert_eq!(grow_chunk(100, 100), 100);
    }

    #[test]
    fn shrink_chunk_halves_and_floors_at_one() {
        assert_eq!(shrink_chunk(10), 5);
        assert_eq!(shrink_chunk(1), 1);
    }
}
