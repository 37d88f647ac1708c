//! Core types: items, attribute values, content hashes, transaction IDs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

/// Transaction identifier (monotonically increasing, logging/tracing only).
pub type TxnId = u64;

/// Maximum inline payload size in bytes (400KB, matching the backend's
/// per-item cap). The configured payload limit may be lower, never higher.
pub const MAX_INLINE_PAYLOAD: usize = 400 * 1024;

/// Caller attribute names must be at least this long. Reserved column names
/// are two characters or fewer, so the namespaces cannot collide.
pub const MIN_ATTRIBUTE_NAME_LEN: usize = 3;

/// Caller attribute names must be at most this long.
pub const MAX_ATTRIBUTE_NAME_LEN: usize = 10;

/// A wire attribute value.
///
/// Numeric values are encoded as numbers, everything else as strings.
/// Absent optional columns are encoded as explicit nulls (not omitted) so
/// that conditional expressions can still reference them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Num(f64),
    Null,
}

impl AttrValue {
    /// Estimated wire size of this value in bytes (for the inline-vs-overflow
    /// decision).
    pub fn byte_size(&self) -> usize {
        match self {
            AttrValue::Str(s) => s.len(),
            AttrValue::Num(_) => 8,
            AttrValue::Null => 1,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            AttrValue::Num(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        AttrValue::Num(n)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Num(n as f64)
    }
}

/// A full wire attribute map, keyed by column name.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// Content digest of an item's canonical payload (xxh3-128).
///
/// Immutable once assigned; doubles as the overflow store key when the
/// payload spills to secondary storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbsoluteHash(u128);

impl AbsoluteHash {
    /// Digest a canonical payload.
    pub fn of(payload: &str) -> Self {
        AbsoluteHash(xxh3_128(payload.as_bytes()))
    }

    /// Parse the 32-character lowercase hex form produced by `Display`.
    pub fn parse(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(AbsoluteHash)
    }
}

impl fmt::Display for AbsoluteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// The unit of storage.
///
/// `(partition_key, sort_key)` is the unique primary key within a service.
/// Exactly one of {inline `payload`, overflow pointer via `absolute_hash`}
/// holds per stored item: a `None` payload on a stored item means the
/// payload lives in the overflow store under `absolute_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Caller-scoped partition key; the store applies the service prefix
    /// before any backend call.
    pub partition_key: String,
    /// Orders items within a partition; opaque caller string.
    pub sort_key: String,
    /// Content digest of the canonical payload.
    pub absolute_hash: AbsoluteHash,
    /// Canonical JSON payload; `None` once overflowed.
    pub payload: Option<String>,
    pub pod_id: Option<i64>,
    pub payload_type: String,
    /// Epoch seconds; drives backend-side expiry. `None` = never expires.
    pub purge_date: Option<u64>,
    /// Caller attributes; keys constrained to 3-10 characters.
    pub additional: AttrMap,
}

impl Item {
    /// Build an item with the hash derived from the payload.
    pub fn new(
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
        payload: impl Into<String>,
        payload_type: impl Into<String>,
    ) -> Self {
        let payload = payload.into();
        Item {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
            absolute_hash: AbsoluteHash::of(&payload),
            payload: Some(payload),
            pod_id: None,
            payload_type: payload_type.into(),
            purge_date: None,
            additional: AttrMap::new(),
        }
    }

    /// Build an item from a JSON payload.
    ///
    /// The payload is rendered in canonical form (compact, object keys in
    /// sorted order) before hashing, so equal documents always produce the
    /// same absolute hash.
    pub fn from_json(
        partition_key: impl Into<String>,
        sort_key: impl Into<String>,
        payload: &serde_json::Value,
        payload_type: impl Into<String>,
    ) -> Self {
        Item::new(partition_key, sort_key, payload.to_string(), payload_type)
    }

    /// Parse the inline payload back into JSON. `None` when the payload is
    /// overflowed-and-unresolved or not valid JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        self.payload
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
    }

    pub fn with_pod_id(mut self, pod_id: i64) -> Self {
        self.pod_id = Some(pod_id);
        self
    }

    pub fn with_purge_date(mut self, epoch_secs: u64) -> Self {
        self.purge_date = Some(epoch_secs);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.additional.insert(name.into(), value.into());
        self
    }
}
