//! Checkpoint codec (C2): a fixed-width, zero-padded string encoding of
//! `(blockTimestamp, chainId, blockNumber, transactionIndex, eventType, eventIndex)`
//! chosen so that lexical string comparison agrees with tuple comparison.

use anyhow::{bail, Context, Result};

const W_TIMESTAMP: usize = 10;
const W_CHAIN_ID: usize = 16;
const W_BLOCK_NUMBER: usize = 16;
const W_TX_INDEX: usize = 16;
const W_EVENT_TYPE: usize = 1;
const W_EVENT_INDEX: usize = 16;

pub const ENCODED_LEN: usize =
    W_TIMESTAMP + W_CHAIN_ID + W_BLOCK_NUMBER + W_TX_INDEX + W_EVENT_TYPE + W_EVENT_INDEX;

/// Kind of event a checkpoint points at: a log match or a block match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Log,
    Block,
}

impl EventType {
    fn digit(self) -> u8 {
        match self {
            EventType::Log => 0,
            EventType::Block => 1,
        }
    }

    fn from_digit(d: u8) -> Result<Self> {
        match d {
            0 => Ok(EventType::Log),
            1 => Ok(EventType::Block),
            other => bail!("unknown checkpoint event type digit: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_type: EventType,
    pub event_index: u64,
}

fn pad(value: u64, width: usize) -> Result<String> {
    let s = value.to_string();
    if s.len() > width {
        bail!("value {value} does not fit in {width} decimal digits");
    }
    Ok(format!("{:0>width$}", s, width = width))
}

impl Checkpoint {
    /// Encode as a fixed-width, lexically-ordered string.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::with_capacity(ENCODED_LEN);
        out.push_str(&pad(self.block_timestamp, W_TIMESTAMP)?);
        out.push_str(&pad(self.chain_id, W_CHAIN_ID)?);
        out.push_str(&pad(self.block_number, W_BLOCK_NUMBER)?);
        out.push_str(&pad(self.transaction_index, W_TX_INDEX)?);
        out.push(char::from_digit(self.event_type.digit() as u32, 10).unwrap());
        out.push_str(&pad(self.event_index, W_EVENT_INDEX)?);
        Ok(out)
    }

    /// Decode a checkpoint previously produced by `encode`.
    pub fn decode(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            bail!("checkpoint string has length {}, expected {ENCODED_LEN}", s.len());
        }
        let mut rest = s;
        let (ts, r) = rest.split_at(W_TIMESTAMP);
        rest = r;
        let (chain, r) = rest.split_at(W_CHAIN_ID);
        rest = r;
        let (block, r) = rest.split_at(W_BLOCK_NUMBER);
        rest = r;
        let (tx, r) = rest.split_at(W_TX_INDEX);
        rest = r;
        let (ty, r) = rest.split_at(W_EVENT_TYPE);
        rest = r;
        let event_index = rest;

        Ok(Checkpoint {
            block_timestamp: ts.parse().context("checkpoint blockTimestamp field")?,
            chain_id: chain.parse().context("checkpoint chainId field")?,
            block_number: block.parse().context("checkpoint blockNumber field")?,
            transaction_index: tx.parse().context("checkpoint transactionIndex field")?,
            event_type: EventType::from_digit(ty.parse().context("checkpoint eventType field")?)?,
            event_index: event_index.parse().context("checkpoint eventIndex field")?,
        })
    }
}

/// The smallest possible encoded checkpoint: sorts before every real checkpoint.
pub fn zero_checkpoint() -> String {
    "0".repeat(ENCODED_LEN)
}

/// The largest possible encoded checkpoint: sorts after every real checkpoint.
pub fn max_checkpoint() -> String {
    "9".repeat(ENCODED_LEN)
}

/// `min(cps...)`: the lexicographically (equivalently, tuple-wise) smallest of a
/// non-empty list of encoded checkpoints.
pub fn min<'a>(cps: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    cps.into_iter().min()
}

/// A checkpoint bound on a `(blockTimestamp, chainId, blockNumber)` triple whose
/// lexicographic tail (txIndex, eventType, eventIndex) is forced to the minimum
/// or maximum representable digit, used to turn a chain's `{start|latest|finalized}`
/// block into an inclusive lower or upper bound for cross-chain comparison.
pub fn bound(block_timestamp: u64, chain_id: u64, block_number: u64, upper: bool) -> Result<String> {
    let mut out = String::with_capacity(ENCODED_LEN);
    out.push_str(&pad(block_timestamp, W_TIMESTAMP)?);
    out.push_str(&pad(chain_id, W_CHAIN_ID)?);
    out.push_str(&pad(block_number, W_BLOCK_NUMBER)?);
    let tail_digit = if upper { '9' } else { '0' };
    out.extend(std::iter::repeat(tail_digit).take(W_TX_INDEX + W_EVENT_TYPE + W_EVENT_INDEX));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(block_timestamp: u64, chain_id: u64, block_number: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            event_type: EventType::Log,
            event_index: 0,
        }
    }

    #[test]
    fn round_trips() {
        let c = Checkpoint {
            block_timestamp: 1_700_000_000,
            chain_id: 8453,
            block_number: 123_456_789,
            transaction_index: 42,
            event_type: EventType::Block,
            event_index: 7,
        };
        let encoded = c.encode().unwrap();
        assert_eq!(encoded.len(), ENCODED_LEN);
        assert_eq!(Checkpoint::decode(&encoded).unwrap(), c);
    }

    #[test]
    fn lexical_order_matches_tuple_order() {
        let earlier = cp(100, 1, 5).encode().unwrap();
        let later_timestamp = cp(101, 1, 0).encode().unwrap();
        let later_block = cp(100, 1, 6).encode().unwrap();
        assert!(earlier < later_timestamp);
        assert!(earlier < later_block);
    }

    #[test]
    fn sentinels_bound_every_real_checkpoint() {
        let mid = cp(1, 1, 1).encode().unwrap();
        assert!(zero_checkpoint() < mid);
        assert!(mid < max_checkpoint());
    }

    #[test]
    fn min_picks_smallest() {
        let a = cp(5, 1, 0).encode().unwrap();
        let b = cp(1, 1, 0).encode().unwrap();
        let c = cp(3, 1, 0).encode().unwrap();
        let picked = min([a.as_str(), b.as_str(), c.as_str()]).unwrap();
        assert_eq!(picked, b);
    }

    #[test]
    fn rejects_overflowing_field() {
        let bad = Checkpoint { chain_id: 10_u64.pow(17), ..cp(0, 0, 0) };
        assert!(bad.encode().is_err());
    }

    #[test]
    fn rejects_wrong_length_on_decode() {
        assert!(Checkpoint::decode("too short").is_err());
    }

    #[test]
    fn bound_brackets_any_event_at_that_block() {
        let lo = bound(100, 1, 5, false).unwrap();
        let hi = bound(100, 1, 5, true).unwrap();
        let event = cp(100, 1, 5).encode().unwrap();
        assert!(lo <= event);
        assert!(event <= hi);
    }
}
