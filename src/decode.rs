//! Downstream-facing event decoding: turns a matched raw log into named,
//! JSON-shaped event arguments, driven by each source's configured ABI rather
//! than a fixed set of compiled event interfaces.
//!
//! This generalizes the teacher's `stream_events!`/`sol!`-macro approach (fixed
//! at compile time to two known contracts) to an ABI supplied at config time,
//! using `alloy`'s dynamic ABI decoder instead of its static `sol!` bindings.

use std::collections::HashMap;

use alloy::dyn_abi::{DynSolValue, EventExt};
use alloy::json_abi::Event as AbiEvent;
use alloy::primitives::B256;
use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::SourceConfig;

/// Per-source, topic0-indexed table of ABI event definitions, built once at
/// startup so hot-path decoding is a hash lookup plus a decode call.
pub struct EventDecoder {
    events: HashMap<(String, B256), AbiEvent>,
}

impl EventDecoder {
    pub fn build(sources: &[SourceConfig]) -> Result<Self> {
        let mut events = HashMap::new();
        for source in sources {
            let Some(abi_json) = &source.abi else { continue };
            for event in parse_abi_events(abi_json)
                .with_context(|| format!("source {} has an invalid abi", source.name))?
            {
                events.insert((source.name.clone(), event.selector()), event);
            }
        }
        Ok(Self { events })
    }

    /// Decode a log's topics/data against the ABI configured for `source_name`.
    /// Returns `None` if the source has no ABI entry for this log's topic0
    /// (the event is still recorded in `sync.event`, just without decoded args).
    pub fn decode(&self, source_name: &str, topics: &[B256], data: &[u8]) -> Result<Option<Value>> {
        let Some(topic0) = topics.first() else { return Ok(None) };
        let Some(event) = self.events.get(&(source_name.to_string(), *topic0)) else {
            return Ok(None);
        };

        let decoded = event
            .decode_log_parts(topics.iter().copied(), data, false)
            .with_context(|| format!("decode log for event {}", event.name))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut out = serde_json::Map::with_capacity(event.inputs.len());
        for input in &event.inputs {
            let value = if input.indexed { indexed.next() } else { body.next() };
            if let Some(value) = value {
                out.insert(input.name.clone(), dyn_sol_value_to_json(&value));
            }
        }
        Ok(Some(Value::Object(out)))
    }

    /// Convenience entry point matching the downstream `decodeEvents` call: pulls
    /// topics/data back out of a materialized log event's stored body (the raw
    /// `eth_getLogs` entry persisted in `sync.log.body`/`sync.event.data`).
    pub fn decode_raw_event(&self, source_name: &str, raw_event_data: &Value) -> Result<Option<Value>> {
        let Some(topics_json) = raw_event_data.get("topics").and_then(Value::as_array) else {
            return Ok(None);
        };
        let topics: Vec<B256> = topics_json
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|t| t.parse::<B256>().ok())
            .collect();
        let data_hex = raw_event_data.get("data").and_then(Value::as_str).unwrap_or("0x");
        let data = hex::decode(data_hex.trim_start_matches("0x")).context("decode log data hex")?;
        self.decode(source_name, &topics, &data)
    }
}

fn parse_abi_events(abi_json: &Value) -> Result<Vec<AbiEvent>> {
    let entries = abi_json.as_array().context("abi must be a JSON array")?;
    let mut events = Vec::new();
    for entry in entries {
        if entry.get("type").and_then(Value::as_str) != Some("event") {
            continue;
        }
        let event: AbiEvent =
            serde_json::from_value(entry.clone()).context("parse abi event entry")?;
        events.push(event);
    }
    Ok(events)
}

fn dyn_sol_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Address(a) => Value::String(a.to_string()),
        DynSolValue::FixedBytes(b, _) => Value::String(format!("0x{}", hex::encode(b.as_slice()))),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            Value::Array(items.iter().map(dyn_sol_value_to_json).collect())
        }
        DynSolValue::Tuple(items) => Value::Array(items.iter().map(dyn_sol_value_to_json).collect()),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_event_entries_from_abi() {
        let abi = serde_json::json!([
            {"type": "function", "name": "foo", "inputs": [], "outputs": []},
            {
                "type": "event",
                "name": "Transfer",
                "inputs": [
                    {"name": "from", "type": "address", "indexed": true},
                    {"name": "to", "type": "address", "indexed": true},
                    {"name": "value", "type": "uint256", "indexed": false}
                ],
                "anonymous": false
            }
        ]);
        let events = parse_abi_events(&abi).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Transfer");
    }

    #[test]
    fn bool_and_address_round_trip_to_json() {
        let addr = alloy::primitives::Address::repeat_byte(0x11);
        assert_eq!(dyn_sol_value_to_json(&DynSolValue::Bool(true)), Value::Bool(true));
        assert_eq!(
            dyn_sol_value_to_json(&DynSolValue::Address(addr)),
            Value::String(addr.to_string())
        );
    }
}
