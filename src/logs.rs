//! Validates raw `eth_getLogs` results into a form where the fields the rest
//! of the engine depends on (block number/hash, tx hash, log index) are
//! guaranteed present, and sorts them into block order. RPC providers only
//! omit these for pending-block logs, which `eth_getLogs` should never return,
//! so treat their absence as a hard error rather than a log to skip.

use alloy::primitives::B256;
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ValidatedLog {
    pub log: alloy::rpc::types::Log,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

pub fn validate_and_sort_logs(raw: Vec<alloy::rpc::types::Log>) -> Result<Vec<ValidatedLog>> {
    let mut out = Vec::with_capacity(raw.len());
    for log in raw {
        let block_number = log.block_number.context("log missing block_number")?;
        let block_hash = log.block_hash.context("log missing block_hash")?;
        let tx_hash = log.transaction_hash.context("log missing transaction_hash")?;
        let log_index = log.log_index.context("log missing log_index")?;
        out.push(ValidatedLog { log, block_number, block_hash, tx_hash, log_index });
    }
    out.sort_by_key(|l| (l.block_number, l.log_index));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_logs_missing_required_fields() {
        let raw = serde_json::json!({
            "address": "0x0000000000000000000000000000000000000001",
            "topics": [],
            "data": "0x",
        });
        let log: alloy::rpc::types::Log = serde_json::from_value(raw).unwrap();
        let err = validate_and_sort_logs(vec![log]).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn sorts_by_block_number_then_log_index() {
        let make = |block: u64, idx: u64| {
            let raw = serde_json::json!({
                "address": "0x0000000000000000000000000000000000000001",
                "topics": [],
                "data": "0x",
                "blockNumber": format!("0x{block:x}"),
                "blockHash": format!("0x{:064x}", block),
                "transactionHash": format!("0x{:064x}", idx),
                "logIndex": format!("0x{idx:x}"),
            });
            serde_json::from_value::<alloy::rpc::types::Log>(raw).unwrap()
        };
        let validated = validate_and_sort_logs(vec![make(5, 1), make(2, 3), make(2, 0)]).unwrap();
        let order: Vec<(u64, u64)> = validated.iter().map(|l| (l.block_number, l.log_index)).collect();
        assert_eq!(order, vec![(2, 0), (2, 3), (5, 1)]);
    }
}
