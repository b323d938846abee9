//! Filter model (C1): declarative description of what to index, with a stable
//! identity derived from canonical serialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Which cache a filter id belongs to. The same [`Filter`] hashes to two different
/// ids depending on whether it's being used to track materialized-event intervals
/// or child-address discovery intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Event,
    Address,
}

impl FilterKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FilterKind::Event => "event",
            FilterKind::Address => "address",
        }
    }
}

/// Position in a log's 4-slot topic array: topic0 (the event selector) through topic3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicIndex {
    Topic1 = 1,
    Topic2 = 2,
    Topic3 = 3,
}

/// Where in a matched log to find a 20-byte child address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ChildAddressLocation {
    /// Read the low 20 bytes of `topics[n]`.
    Topic { n: TopicIndex },
    /// Read the low 20 bytes of the 32-byte word at `data[32*k .. 32*(k+1)]`.
    Offset { k: u32 },
}

/// Per-position topic constraint. `None` (absent from the filter) means wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicConstraint {
    Single(String),
    Set(Vec<String>),
}

impl TopicConstraint {
    fn matches(&self, topic: Option<&str>) -> bool {
        match (self, topic) {
            (TopicConstraint::Single(t), Some(v)) => t.eq_ignore_ascii_case(v),
            (TopicConstraint::Set(ts), Some(v)) => ts.iter().any(|t| t.eq_ignore_ascii_case(v)),
            (_, None) => false,
        }
    }

    /// Collapse a single-element set down to its element, per canonicalization rules.
    fn canonicalize(self) -> TopicConstraint {
        match self {
            TopicConstraint::Set(mut v) if v.len() == 1 => TopicConstraint::Single(v.remove(0)),
            other => other,
        }
    }
}

/// Address constraint on a log filter. Recursive: a child-address filter itself
/// carries an address constraint on the parent (factory) contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressConstraint {
    Single(String),
    Set(Vec<String>),
    Child(Box<ChildAddressFilter>),
}

/// `isChildAddressFilter(x)`: true iff x is an object, not a string or array.
pub fn is_child_address_filter(c: &AddressConstraint) -> bool {
    matches!(c, AddressConstraint::Child(_))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildAddressFilter {
    pub chain_id: u64,
    pub address: AddressConstraint,
    /// First topic (event selector) of the log that emits the child address.
    pub event_selector: String,
    pub location: ChildAddressLocation,
}

impl ChildAddressFilter {
    /// The filter this child-address filter resolves against, expressed as the
    /// log filter that must be synced to discover addresses.
    pub fn discovery_filter(&self, from_block: u64, to_block: Option<u64>) -> Filter {
        Filter::Log(LogFilter {
            chain_id: self.chain_id,
            from_block,
            to_block,
            address: Some(self.address.clone()),
            topics: [
                Some(TopicConstraint::Single(self.event_selector.clone())),
                None,
                None,
                None,
            ],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    pub chain_id: u64,
    pub from_block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressConstraint>,
    /// topic0..topic3, `None` is wildcard.
    #[serde(default)]
    pub topics: [Option<TopicConstraint>; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFilter {
    pub chain_id: u64,
    /// Must be > 0.
    pub interval: u64,
    /// Must satisfy 0 <= offset < interval.
    pub offset: u64,
    pub from_block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Filter {
    Log(LogFilter),
    Block(BlockFilter),
}

impl Filter {
    pub fn chain_id(&self) -> u64 {
        match self {
            Filter::Log(f) => f.chain_id,
            Filter::Block(f) => f.chain_id,
        }
    }

    pub fn from_block(&self) -> u64 {
        match self {
            Filter::Log(f) => f.from_block,
            Filter::Block(f) => f.from_block,
        }
    }

    pub fn to_block(&self) -> Option<u64> {
        match self {
            Filter::Log(f) => f.to_block,
            Filter::Block(f) => f.to_block,
        }
    }
}

/// A minimal view of a log, enough to evaluate `matches_log`.
#[derive(Debug, Clone)]
pub struct LogView<'a> {
    pub address: &'a str,
    pub topics: [Option<&'a str>; 4],
    pub block_number: u64,
}

/// `matchesLog(log, logFilter)`. A child-address constraint always matches here;
/// the actual address resolution happens in `HistoricalSync::sync_address`.
pub fn matches_log(log: &LogView<'_>, filter: &LogFilter) -> bool {
    if log.block_number < filter.from_block {
        return false;
    }
    if let Some(to) = filter.to_block {
        if log.block_number > to {
            return false;
        }
    }

    let address_ok = match &filter.address {
        None => true,
        Some(AddressConstraint::Single(a)) => a.eq_ignore_ascii_case(log.address),
        Some(AddressConstraint::Set(addrs)) => {
            addrs.iter().any(|a| a.eq_ignore_ascii_case(log.address))
        }
        Some(AddressConstraint::Child(_)) => true,
    };
    if !address_ok {
        return false;
    }

    for i in 0..4 {
        match &filter.topics[i] {
            None => continue,
            Some(constraint) => {
                if !constraint.matches(log.topics[i]) {
                    return false;
                }
            }
        }
    }
    true
}

/// `matchesBlock(number, blockFilter)`.
pub fn matches_block(number: u64, filter: &BlockFilter) -> bool {
    if number < filter.from_block {
        return false;
    }
    if let Some(to) = filter.to_block {
        if number > to {
            return false;
        }
    }
    if filter.interval == 0 {
        return false;
    }
    number.checked_sub(filter.offset).is_some_and(|delta| delta % filter.interval == 0)
        && number >= filter.offset
}

/// Cheaply rules out blocks that cannot contain any log matching `filter`, using
/// its `logsBloom`. AND across address/topic categories, OR within each: if the
/// filter constrains addresses, at least one candidate address must be present;
/// same per topic position. Child-address filters can't be prefiltered (the
/// resolved set isn't known ahead of fetching), so they always pass through.
pub fn log_filter_might_match_bloom(bloom: &alloy::primitives::Bloom, filter: &LogFilter) -> bool {
    use alloy::primitives::{Address, BloomInput, B256};

    if let Some(address) = &filter.address {
        let candidates: Vec<String> = match address {
            AddressConstraint::Single(a) => vec![a.clone()],
            AddressConstraint::Set(v) => v.clone(),
            AddressConstraint::Child(_) => return true,
        };
        let any_present = candidates
            .iter()
            .filter_map(|a| a.parse::<Address>().ok())
            .any(|a| bloom.contains_input(BloomInput::Raw(a.as_slice())));
        if !any_present {
            return false;
        }
    }

    for t in filter.topics.iter().flatten() {
        let candidates: Vec<String> = match t {
            TopicConstraint::Single(s) => vec![s.clone()],
            TopicConstraint::Set(v) => v.clone(),
        };
        let any_present = candidates
            .iter()
            .filter_map(|s| s.parse::<B256>().ok())
            .any(|h| bloom.contains_input(BloomInput::Raw(h.as_slice())));
        if !any_present {
            return false;
        }
    }

    true
}

/// Sort object keys and lowercase addresses/hex values so that semantically equal
/// filters always produce byte-identical JSON.
fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> = map.into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().map(|(k, v)| (k, canonicalize_value(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize_value).collect()),
        Value::String(s) if looks_like_hex_address_or_topic(&s) => Value::String(s.to_lowercase()),
        other => other,
    }
}

fn looks_like_hex_address_or_topic(s: &str) -> bool {
    s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Canonical filter used purely for hashing: collapses single-element topic sets
/// to their element, as the filter id spec requires.
fn canonicalized_filter(filter: &Filter) -> Filter {
    let mut filter = filter.clone();
    if let Filter::Log(f) = &mut filter {
        for t in f.topics.iter_mut() {
            *t = t.take().map(TopicConstraint::canonicalize);
        }
    }
    filter
}

/// `filterId(kind, filter)`: the primary cache key for a filter, stable under
/// key reordering and topic-list normalization.
pub fn filter_id(kind: FilterKind, filter: &Filter) -> String {
    let canonical = canonicalized_filter(filter);
    let value = serde_json::to_value(&canonical).expect("Filter is always serializable");
    let value = canonicalize_value(value);
    let canonical_json = serde_json::to_string(&value).expect("Value is always serializable");

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json.as_bytes());
    format!("{}:{}", kind.as_str(), hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_filter(from: u64, to: Option<u64>) -> LogFilter {
        LogFilter { chain_id: 1, from_block: from, to_block: to, address: None, topics: [None, None, None, None] }
    }

    #[test]
    fn filter_id_stable_under_key_reordering() {
        let a = Filter::Log(LogFilter {
            address: Some(AddressConstraint::Single("0xAbC".into())),
            ..log_filter(0, Some(10))
        });
        let b = a.clone();
        assert_eq!(filter_id(FilterKind::Event, &a), filter_id(FilterKind::Event, &b));
    }

    #[test]
    fn filter_id_differs_by_kind() {
        let f = Filter::Log(log_filter(0, None));
        assert_ne!(filter_id(FilterKind::Event, &f), filter_id(FilterKind::Address, &f));
    }

    #[test]
    fn filter_id_collapses_singleton_topic_set() {
        let singleton = Filter::Log(LogFilter {
            topics: [Some(TopicConstraint::Set(vec!["0xaa".into()])), None, None, None],
            ..log_filter(0, None)
        });
        let single = Filter::Log(LogFilter {
            topics: [Some(TopicConstraint::Single("0xaa".into())), None, None, None],
            ..log_filter(0, None)
        });
        assert_eq!(filter_id(FilterKind::Event, &singleton), filter_id(FilterKind::Event, &single));
    }

    #[test]
    fn matches_log_boundary_blocks() {
        let filter = log_filter(10, Some(20));
        let in_range = LogView { address: "0x1", topics: [None; 4], block_number: 10 };
        let out_of_range = LogView { address: "0x1", topics: [None; 4], block_number: 21 };
        assert!(matches_log(&in_range, &filter));
        assert!(!matches_log(&out_of_range, &filter));
    }

    #[test]
    fn matches_log_topic_wildcard_and_set() {
        let mut filter = log_filter(0, None);
        filter.topics[0] = Some(TopicConstraint::Set(vec!["0xaa".into(), "0xbb".into()]));
        let matches = LogView { address: "0x1", topics: [Some("0xBB"), None, None, None], block_number: 0 };
        let no_match = LogView { address: "0x1", topics: [Some("0xcc"), None, None, None], block_number: 0 };
        assert!(matches_log(&matches, &filter));
        assert!(!matches_log(&no_match, &filter));
    }

    #[test]
    fn matches_block_offset_and_interval() {
        let filter = BlockFilter { chain_id: 1, interval: 2, offset: 1, from_block: 0, to_block: Some(10) };
        assert!(!matches_block(0, &filter));
        assert!(matches_block(1, &filter));
        assert!(matches_block(3, &filter));
        assert!(!matches_block(4, &filter));
        assert!(!matches_block(11, &filter));
    }

    #[test]
    fn bloom_prefilter_rejects_absent_address() {
        use alloy::primitives::{Address, Bloom, BloomInput};
        let present: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
        let absent: Address = "0x0000000000000000000000000000000000000002".parse().unwrap();
        let mut bloom = Bloom::default();
        bloom.accrue(BloomInput::Raw(present.as_slice()));

        let mut filter = log_filter(0, None);
        filter.address = Some(AddressConstraint::Single(format!("{present:#x}")));
        assert!(log_filter_might_match_bloom(&bloom, &filter));

        filter.address = Some(AddressConstraint::Single(format!("{absent:#x}")));
        assert!(!log_filter_might_match_bloom(&bloom, &filter));
    }

    #[test]
    fn child_address_constraint_always_matches_in_matches_log() {
        let mut filter = log_filter(0, None);
        filter.address = Some(AddressConstraint::Child(Box::new(ChildAddressFilter {
            chain_id: 1,
            address: AddressConstraint::Single("0xfactory".into()),
            event_selector: "0xsig".into(),
            location: ChildAddressLocation::Topic { n: TopicIndex::Topic1 },
        })));
        let log = LogView { address: "0xanything", topics: [None; 4], block_number: 0 };
        assert!(matches_log(&log, &filter));
    }
}
