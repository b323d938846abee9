//! Omnichain Coordinator (C8): merges every chain's progress into a single
//! checkpoint-ordered event stream and dispatches realtime events to the
//! downstream layer. Generalizes the teacher's `runner.rs` top-level loop
//! (one `tokio::select!` per chain, `CancellationToken` shutdown) from two
//! hardcoded contracts to an arbitrary set of configured chains and sources.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint;
use crate::config::AppConfig;
use crate::filter::{Filter, FilterKind};
use crate::local::LocalSync;
use crate::realtime::{RealtimeEvent, RealtimeSync};
use crate::rpc::{self, RpcClient};
use crate::store::{self, Db, EventRow};

const PAGE_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    New,
    Historical,
    Tip,
    Realtime,
    Complete,
    Killed,
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub filter_id: String,
    pub checkpoint: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: Option<u64>,
    pub transaction_hash: Option<String>,
    pub data: serde_json::Value,
}

impl From<EventRow> for RawEvent {
    fn from(r: EventRow) -> Self {
        RawEvent {
            filter_id: r.filter_id,
            checkpoint: r.checkpoint,
            chain_id: r.chain_id as u64,
            block_number: r.block_number as u64,
            block_hash: r.block_hash,
            log_index: r.log_index.map(|i| i as u64),
            transaction_hash: r.transaction_hash,
            data: r.data,
        }
    }
}

/// What the coordinator hands to downstream code: either a page of the
/// historical backfill, or a translated realtime notification.
#[derive(Debug, Clone)]
pub enum DownstreamEvent {
    Historical(Vec<RawEvent>),
    Block(Vec<RawEvent>),
    Finalize(String),
    Reorg(String),
}

struct Chain {
    local: LocalSync,
    filter_ids: Vec<String>,
    filters: Vec<Filter>,
    state: ChainState,
    prev_finalized: u64,
    realtime: Option<RealtimeSync>,
}

pub struct Coordinator {
    db: Db,
    chains: Vec<Chain>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Db::connect(&config.database_url, config.db_max_connections).await?;
        let shutdown = CancellationToken::new();

        let mut chains = Vec::new();
        for network in &config.networks {
            let sources: Vec<_> = config.sources.iter().filter(|s| s.network_name == network.name).collect();
            if sources.is_empty() {
                continue;
            }
            let rpc = RpcClient::new(network.rpc_urls.clone())?;
            let filters: Vec<Filter> = sources.iter().map(|s| s.filter.clone()).collect();
            let filter_ids: Vec<String> = filters.iter().map(|f| crate::filter::filter_id(FilterKind::Event, f)).collect();

            let local = LocalSync::new(network.clone(), rpc, db.clone(), &filters, config.blocks_per_event, shutdown.clone())
                .await
                .with_context(|| format!("starting local sync for chain {}", network.chain_id))?;

            chains.push(Chain { local, filter_ids, filters, state: ChainState::New, prev_finalized: 0, realtime: None });
        }
        anyhow::ensure!(!chains.is_empty(), "no configured chain has any source");

        Ok(Self { db, chains, shutdown })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn kill(&mut self) {
        self.shutdown.cancel();
        for c in &mut self.chains {
            c.state = ChainState::Killed;
        }
    }

    /// Wraps this network's RPC client behind the read-through cache so user
    /// code that pokes at chain state directly reuses already-fetched responses.
    pub fn get_cached_transport(&self, chain_id: u64) -> Option<CachedTransport> {
        self.chains
            .iter()
            .find(|c| c.local.chain_id() == chain_id)
            .map(|c| CachedTransport { db: self.db.clone(), chain_id, rpc: c.local.rpc().clone() })
    }

    fn all_filter_ids(&self) -> Vec<String> {
        self.chains.iter().flat_map(|c| c.filter_ids.iter().cloned()).collect()
    }

    fn min_chain_checkpoint(&self, tag: &str) -> Option<String> {
        let mut min: Option<String> = None;
        for c in &self.chains {
            let encoded = match tag {
                "start" => checkpoint::bound(c.local.start_head.timestamp, c.local.chain_id(), c.local.start_head.number, false).ok()?,
                "finalized" => {
                    checkpoint::bound(c.local.finalized_block.timestamp, c.local.chain_id(), c.local.finalized_block.number, true).ok()?
                }
                "latest" => {
                    let head = c.local.latest_block()?;
                    checkpoint::bound(head.timestamp, c.local.chain_id(), head.number, true).ok()?
                }
                other => unreachable!("unknown checkpoint tag {other}"),
            };
            min = Some(match min {
                Some(m) if m <= encoded => m,
                _ => encoded,
            });
        }
        min
    }

    /// Runs the historical backfill outer/inner pagination loop, sending each
    /// page downstream until every chain's finalized boundary is reached.
    pub async fn run_historical(&mut self, tx: &mpsc::Sender<DownstreamEvent>) -> Result<()> {
        let start = self.min_chain_checkpoint("start").context("no chains configured")?;
        let end = loop {
            if let Some(end) = self.min_chain_checkpoint("finalized") {
                break end;
            }
            // no chain has a finalized block yet (shouldn't happen post-init); retry after a sync pass.
            self.sync_all_chains().await?;
        };
        let mut from = start;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.sync_all_chains().await?;

            let Some(to) = self.min_chain_checkpoint("latest") else {
                continue;
            };

            let filter_ids = self.all_filter_ids();
            while from < to {
                let rows = store::get_events(&self.db, &filter_ids, &from, &to, PAGE_LIMIT).await?;
                if rows.is_empty() {
                    break;
                }
                let cursor = rows.last().unwrap().checkpoint.clone();
                let batch: Vec<RawEvent> = rows.into_iter().map(RawEvent::from).collect();
                if tx.send(DownstreamEvent::Historical(batch)).await.is_err() {
                    return Ok(());
                }
                from = cursor;
            }

            if to >= end {
                break;
            }
        }

        for c in &mut self.chains {
            if c.state == ChainState::New {
                c.state = ChainState::Historical;
            }
            if c.local.is_complete() {
                c.state = ChainState::Complete;
            } else if c.state != ChainState::Complete {
                c.state = ChainState::Tip;
            }
        }
        Ok(())
    }

    async fn sync_all_chains(&mut self) -> Result<()> {
        let futures = self.chains.iter_mut().map(|c| {
            if c.state == ChainState::New {
                c.state = ChainState::Historical;
            }
            c.local.sync()
        });
        futures::future::try_join_all(futures).await?;
        Ok(())
    }

    /// Starts realtime followers for every chain whose `endBlock` is not yet
    /// finalized; `run_realtime` then drives each one's polling and
    /// translation. Keeping polling in a single task (rather than one spawned
    /// task per chain) is what gives the downstream event queue its
    /// single-concurrency serialization guarantee.
    pub fn start_realtime(&mut self) {
        for c in &mut self.chains {
            if c.local.is_complete() || c.realtime.is_some() {
                continue;
            }
            let log_filters = c
                .filters
                .iter()
                .filter_map(|f| match f {
                    Filter::Log(lf) => Some(lf.clone()),
                    Filter::Block(_) => None,
                })
                .collect();
            let tip = c.local.latest_block().cloned().unwrap_or_else(|| c.local.finalized_block.clone());
            c.realtime = Some(RealtimeSync::new(
                c.local.network.clone(),
                c.local.rpc().clone(),
                c.local.db().clone(),
                log_filters,
                tip,
                c.local.finalized_block.clone(),
                self.shutdown.clone(),
            ));
            c.state = ChainState::Realtime;
            c.prev_finalized = c.local.finalized_block.number;
        }
        info!("realtime followers started");
    }

    /// Polls every active follower once, in declaration order, translating
    /// and forwarding whatever events resulted. Call this in a loop from
    /// `main.rs` until `kill()` is observed.
    pub async fn run_realtime_once(&mut self, tx: &mpsc::Sender<DownstreamEvent>) -> Result<()> {
        for idx in 0..self.chains.len() {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            let Some(mut follower) = self.chains[idx].realtime.take() else { continue };
            let result = follower.poll().await;
            self.chains[idx].realtime = Some(follower);
            let events = match result {
                Ok(events) => events,
                Err(err) => {
                    let chain_id = self.chains[idx].local.chain_id();
                    warn!(chain_id, err = %err, "realtime follower failed, dropping chain");
                    self.chains[idx].realtime = None;
                    self.chains[idx].state = ChainState::Killed;
                    continue;
                }
            };
            for event in events {
                self.apply_realtime_event(idx, event, tx).await?;
            }
        }
        Ok(())
    }

    /// Applies one realtime event for chain `chain_idx`, performing the
    /// `block` / `finalize` / `reorg` translation described in the spec and
    /// emitting whatever downstream events result.
    async fn apply_realtime_event(
        &mut self,
        chain_idx: usize,
        event: RealtimeEvent,
        tx: &mpsc::Sender<DownstreamEvent>,
    ) -> Result<()> {
        match event {
            RealtimeEvent::Block(new_block) => {
                let from = self.min_chain_checkpoint("latest");
                {
                    let c = &mut self.chains[chain_idx];
                    for f in c.filters.clone() {
                        let filter_id = crate::filter::filter_id(FilterKind::Event, &f);
                        store::populate_events(&self.db, &filter_id, &f, (new_block.number, new_block.number)).await?;
                    }
                    c.local.set_realtime_override(Some(new_block));
                }
                let Some(from) = from else { return Ok(()) };
                let Some(to) = self.min_chain_checkpoint("latest") else { return Ok(()) };
                let filter_ids = self.all_filter_ids();
                let mut cursor = from;
                while cursor < to {
                    let rows = store::get_events(&self.db, &filter_ids, &cursor, &to, PAGE_LIMIT).await?;
                    if rows.is_empty() {
                        break;
                    }
                    cursor = rows.last().unwrap().checkpoint.clone();
                    let batch: Vec<RawEvent> = rows.into_iter().map(RawEvent::from).collect();
                    if tx.send(DownstreamEvent::Block(batch)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            RealtimeEvent::Finalize(new_finalized) => {
                let prev_checkpoint = self.min_chain_checkpoint("finalized");
                let prev_number;
                {
                    let c = &mut self.chains[chain_idx];
                    prev_number = c.prev_finalized;
                    for f in c.filters.clone() {
                        let filter_id = crate::filter::filter_id(FilterKind::Event, &f);
                        store::populate_events(&self.db, &filter_id, &f, (prev_number + 1, new_finalized.number)).await?;
                        store::insert_interval(&self.db, "event", c.local.chain_id(), &filter_id, (prev_number + 1, new_finalized.number)).await?;
                    }
                    c.local.set_finalized(new_finalized.clone());
                    c.prev_finalized = new_finalized.number;
                }
                let new_checkpoint = self.min_chain_checkpoint("finalized");
                if prev_checkpoint != new_checkpoint {
                    if let Some(cp) = new_checkpoint {
                        let _ = tx.send(DownstreamEvent::Finalize(cp)).await;
                    }
                }
                let c = &mut self.chains[chain_idx];
                if c.local.is_complete() {
                    c.state = ChainState::Complete;
                }
            }
            RealtimeEvent::Reorg(ancestor) => {
                let c = &mut self.chains[chain_idx];
                let chain_id = c.local.chain_id();
                store::prune_above(&self.db, chain_id, ancestor.number).await?;
                for filter_id in &c.filter_ids {
                    store::truncate_intervals(&self.db, "event", chain_id, filter_id, ancestor.number).await?;
                }
                c.local.set_realtime_override(Some(ancestor.clone()));
                let cp = checkpoint::bound(ancestor.timestamp, chain_id, ancestor.number, true)?;
                let _ = tx.send(DownstreamEvent::Reorg(cp)).await;
            }
        }
        Ok(())
    }
}

/// Read-through RPC cache used by user code outside the sync engine proper.
pub struct CachedTransport {
    db: Db,
    chain_id: u64,
    rpc: RpcClient,
}

impl CachedTransport {
    pub async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        if !rpc::is_cacheable(method) {
            return self.rpc.request(method, params).await;
        }
        let key = rpc::cache_key(method, &params);
        if let Some(cached) = store::get_rpc_request_result(&self.db, self.chain_id, &key).await? {
            return Ok(cached);
        }
        let result = self.rpc.request(method, params).await?;
        store::insert_rpc_request_result(&self.db, self.chain_id, &key, None, &result).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_row_converts_to_raw_event() {
        let row = EventRow {
            filter_id: "event:abc".into(),
            checkpoint: "0".repeat(75),
            chain_id: 8453,
            block_number: 10,
            block_hash: "0xaa".into(),
            log_index: Some(2),
            transaction_hash: Some("0xbb".into()),
            data: serde_json::json!({}),
        };
        let raw: RawEvent = row.into();
        assert_eq!(raw.chain_id, 8453);
        assert_eq!(raw.log_index, Some(2));
    }
}
