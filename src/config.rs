//! Environment-variable configuration, loaded with `envy` + `dotenvy` the way
//! the teacher's indexer does: a base struct of scalars plus JSON-blob env vars
//! for the variable-length bits (here: the chain list and the source list,
//! where the teacher had a fixed `Pool`/`Forwarders` split).

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::filter::Filter;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CHUNK_BLOCKS: u64 = 2_000;
pub const DEFAULT_FINALITY_DEPTH: u64 = 64;
pub const DEFAULT_REORG_SCAN_DEPTH: u64 = 256;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_BLOCK_HEADER_CONCURRENCY: usize = 16;
pub const DEFAULT_BLOCKS_PER_EVENT: f64 = 0.25;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

trait IfEmpty {
    fn if_empty(self, default: Self) -> Self;
}

impl IfEmpty for String {
    fn if_empty(self, default: Self) -> Self {
        if self.is_empty() {
            default
        } else {
            self
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[derive(Debug, Deserialize, Default)]
struct BaseEnv {
    #[serde(default)]
    database_url: String,
    #[serde(default)]
    db_max_connections: Option<u32>,
    #[serde(default)]
    block_header_concurrency: Option<usize>,
    #[serde(default)]
    progress_interval_secs: Option<u64>,
    #[serde(default)]
    blocks_per_event: Option<f64>,
    /// JSON array of [`NetworkEnvEntry`].
    #[serde(default)]
    chains_json: String,
    /// JSON array of [`SourceEnvEntry`].
    #[serde(default)]
    sources_json: String,
}

#[derive(Debug, Deserialize)]
struct NetworkEnvEntry {
    chain_id: u64,
    name: String,
    /// Comma-separated list of RPC URLs, same shape as the teacher's RPC env vars.
    rpc_urls: String,
    finality_depth: Option<u64>,
    poll_interval_ms: Option<u64>,
    chunk_blocks: Option<u64>,
    reorg_scan_depth: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SourceEnvEntry {
    name: String,
    network_name: String,
    filter: Filter,
    /// Raw ABI JSON for the events this source decodes, looked up by topic0.
    #[serde(default)]
    abi: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub finality_depth: u64,
    pub poll_interval_ms: u64,
    pub chunk_blocks: u64,
    pub reorg_scan_depth: u64,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub network_name: String,
    pub filter: Filter,
    pub abi: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub block_header_concurrency: usize,
    pub progress_interval_secs: u64,
    /// Base pacing value; divide by a chain's own source count to get that
    /// chain's `LocalSync` step size (spec's `0.25 / numSources`, per chain).
    pub blocks_per_event: f64,
    pub networks: Vec<NetworkConfig>,
    pub sources: Vec<SourceConfig>,
}

pub fn load_config() -> Result<AppConfig> {
    dotenvy::dotenv().ok();

    let base: BaseEnv = envy::from_env().context("failed to load base environment configuration")?;

    let database_url = base.database_url.if_empty(String::new());
    if database_url.is_empty() {
        bail!("DATABASE_URL must be set");
    }
    if base.chains_json.is_empty() {
        bail!("CHAINS_JSON must be set to a JSON array of chain configs");
    }
    if base.sources_json.is_empty() {
        bail!("SOURCES_JSON must be set to a JSON array of source configs");
    }

    let network_entries: Vec<NetworkEnvEntry> =
        serde_json::from_str(&base.chains_json).context("CHAINS_JSON is not valid JSON")?;
    let source_entries: Vec<SourceEnvEntry> =
        serde_json::from_str(&base.sources_json).context("SOURCES_JSON is not valid JSON")?;

    if network_entries.is_empty() {
        bail!("CHAINS_JSON must list at least one chain");
    }

    let networks: Vec<NetworkConfig> = network_entries
        .into_iter()
        .map(|e| {
            let rpc_urls = parse_list(&e.rpc_urls);
            if rpc_urls.is_empty() {
                bail!("chain {} ({}) has no rpc_urls", e.name, e.chain_id);
            }
            Ok(NetworkConfig {
                chain_id: e.chain_id,
                name: e.name,
                rpc_urls,
                finality_depth: e.finality_depth.unwrap_or(DEFAULT_FINALITY_DEPTH),
                poll_interval_ms: e.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                chunk_blocks: e.chunk_blocks.unwrap_or(DEFAULT_CHUNK_BLOCKS),
                reorg_scan_depth: e.reorg_scan_depth.unwrap_or(DEFAULT_REORG_SCAN_DEPTH),
            })
        })
        .collect::<Result<_>>()?;

    let network_names: std::collections::HashSet<&str> =
        networks.iter().map(|n| n.name.as_str()).collect();

    let sources: Vec<SourceConfig> = source_entries
        .into_iter()
        .map(|e| {
            if !network_names.contains(e.network_name.as_str()) {
                bail!("source {} references unknown network {}", e.name, e.network_name);
            }
            Ok(SourceConfig { name: e.name, network_name: e.network_name, filter: e.filter, abi: e.abi })
        })
        .collect::<Result<_>>()?;

    Ok(AppConfig {
        database_url,
        db_max_connections: base.db_max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
        block_header_concurrency: base
            .block_header_concurrency
            .unwrap_or(DEFAULT_BLOCK_HEADER_CONCURRENCY),
        progress_interval_secs: base.progress_interval_secs.unwrap_or(DEFAULT_PROGRESS_INTERVAL_SECS),
        blocks_per_event: base.blocks_per_event.unwrap_or(DEFAULT_BLOCKS_PER_EVENT),
        networks,
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(parse_list(" a, b ,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn if_empty_falls_back() {
        assert_eq!(String::new().if_empty("x".to_string()), "x");
        assert_eq!("y".to_string().if_empty("x".to_string()), "y");
    }
}
