/// Partition key ranges, partition keys and the effective partition key space
use super::range::Range;
use crate::error::{RoutingError, RoutingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest effective partition key (inclusive)
pub const MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "";

/// Upper bound of the effective partition key space (exclusive)
pub const MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY: &str = "FF";

/// Bounds a routing map must cover, `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    range: Range<String>,
}

impl KeySpace {
    pub fn new<S: Into<String>>(min: S, max: S) -> RoutingResult<Self> {
        Ok(Self {
            range: Range::half_open(min.into(), max.into())?,
        })
    }

    /// The full hashed key space used by collections
    pub fn effective_partition_key() -> Self {
        Self {
            range: Range::new_unchecked(
                MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY.to_string(),
                MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY.to_string(),
                true,
                false,
            ),
        }
    }

    pub fn min(&self) -> &str {
        self.range.min()
    }

    pub fn max(&self) -> &str {
        self.range.max()
    }

    pub fn full_range(&self) -> &Range<String> {
        &self.range
    }

    pub fn contains(&self, key: &str) -> bool {
        key >= self.min() && key < self.max()
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::effective_partition_key()
    }
}

/// Opaque reference to the replica set serving a partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new<S: Into<String>>(identity: S) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical partition: its id and the slice of the hashed key space it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyRange {
    pub id: String,
    pub range: Range<String>,
    /// Ids of the ranges this one was split or merged from
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    /// Create a `[min, max)` partition key range
    pub fn new<S: Into<String>>(id: S, min: S, max: S) -> RoutingResult<Self> {
        Ok(Self {
            id: id.into(),
            range: Range::half_open(min.into(), max.into())?,
            parents: Vec::new(),
        })
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_inclusive(&self) -> &str {
        self.range.min()
    }

    pub fn max_exclusive(&self) -> &str {
        self.range.max()
    }
}

impl fmt::Display for PartitionKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.range)
    }
}

/// A single partition key component as supplied by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionKeyValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl From<&str> for PartitionKeyValue {
    fn from(value: &str) -> Self {
        PartitionKeyValue::String(value.to_string())
    }
}

impl From<String> for PartitionKeyValue {
    fn from(value: String) -> Self {
        PartitionKeyValue::String(value)
    }
}

impl From<f64> for PartitionKeyValue {
    fn from(value: f64) -> Self {
        PartitionKeyValue::Number(value)
    }
}

impl From<i64> for PartitionKeyValue {
    fn from(value: i64) -> Self {
        PartitionKeyValue::Number(value as f64)
    }
}

impl From<bool> for PartitionKeyValue {
    fn from(value: bool) -> Self {
        PartitionKeyValue::Bool(value)
    }
}

// Type markers of the canonical encoding
const MARKER_NULL: u8 = 0x01;
const MARKER_FALSE: u8 = 0x02;
const MARKER_TRUE: u8 = 0x03;
const MARKER_NUMBER: u8 = 0x05;
const MARKER_STRING: u8 = 0x08;
const STRING_TERMINATOR: u8 = 0x00;

/// Logical partition key of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionKey(PartitionKeyValue);

impl PartitionKey {
    pub fn new<V: Into<PartitionKeyValue>>(value: V) -> Self {
        Self(value.into())
    }

    pub fn null() -> Self {
        Self(PartitionKeyValue::Null)
    }

    pub fn value(&self) -> &PartitionKeyValue {
        &self.0
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        match &self.0 {
            PartitionKeyValue::Null => vec![MARKER_NULL],
            PartitionKeyValue::Bool(false) => vec![MARKER_FALSE],
            PartitionKeyValue::Bool(true) => vec![MARKER_TRUE],
            PartitionKeyValue::Number(n) => {
                let mut bytes = Vec::with_capacity(9);
                bytes.push(MARKER_NUMBER);
                bytes.extend_from_slice(&n.to_be_bytes());
                bytes
            }
            PartitionKeyValue::String(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 2);
                bytes.push(MARKER_STRING);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(STRING_TERMINATOR);
                bytes
            }
        }
    }

    /// Hashed, hex-encoded key used to locate the owning partition
    ///
    /// The top two bits of the first byte are cleared so every hash sorts
    /// below `"40"`, well inside `["", "FF")`.
    pub fn effective_partition_key(&self) -> String {
        let mut digest = md5::compute(self.canonical_bytes()).0;
        digest[0] &= 0x3F;
        hex::encode_upper(digest)
    }
}

/// Validate a caller-supplied effective partition key against the key space
pub fn validate_effective_partition_key(key: &str, key_space: &KeySpace) -> RoutingResult<()> {
    let well_formed = key.len() % 2 == 0
        && key
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c));

    if !well_formed || !key_space.contains(key) {
        return Err(RoutingError::InvalidEffectivePartitionKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_range_creation() {
        let range = PartitionKeyRange::new("0", "", "80").unwrap();
        assert_eq!(range.min_inclusive(), "");
        assert_eq!(range.max_exclusive(), "80");
        assert!(range.range.contains(&"7F".to_string()));
        assert!(!range.range.contains(&"80".to_string()));
        assert!(range.parents.is_empty());

        let child = PartitionKeyRange::new("1", "", "40").unwrap().with_parents(["0"]);
        assert_eq!(child.parents, vec!["0".to_string()]);
        assert_eq!(child.to_string(), "1:[\"\",\"40\")");
    }

    #[test]
    fn test_partition_key_range_rejects_inverted_bounds() {
        assert!(PartitionKeyRange::new("0", "80", "40").is_err());
    }

    #[test]
    fn test_effective_partition_key_is_deterministic() {
        let first = PartitionKey::new("customer-42").effective_partition_key();
        let second = PartitionKey::new("customer-42").effective_partition_key();
        assert_eq!(first, second);
        assert_eq!(first, "2B63B1F06073DD858D4418A6E5D36CE9");
        assert_eq!(first.len(), 32);
        assert!(first.as_str() < "40");
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_effective_partition_key_distinguishes_types() {
        let as_string = PartitionKey::new("1").effective_partition_key();
        let as_number = PartitionKey::new(1i64).effective_partition_key();
        let as_bool = PartitionKey::new(true).effective_partition_key();
        let as_null = PartitionKey::null().effective_partition_key();

        assert_ne!(as_string, as_number);
        assert_ne!(as_bool, as_null);
        for key in [&as_string, &as_number, &as_bool, &as_null] {
            assert!(KeySpace::default().contains(key));
        }
    }

    #[test]
    fn test_key_space() {
        let space = KeySpace::default();
        assert!(space.contains(""));
        assert!(space.contains("FE"));
        assert!(!space.contains("FF"));

        let full = space.full_range();
        assert_eq!(full.min(), "");
        assert_eq!(full.max(), "FF");
        assert!(!full.is_max_inclusive());
    }

    #[test]
    fn test_validate_effective_partition_key() {
        let space = KeySpace::default();
        assert!(validate_effective_partition_key("3F", &space).is_ok());
        assert!(validate_effective_partition_key("", &space).is_ok());
        assert!(validate_effective_partition_key("FF", &space).is_err());
        assert!(validate_effective_partition_key("3f", &space).is_err());
        assert!(validate_effective_partition_key("ABC", &space).is_err());
    }
}
