//! Versioned records: the unit of bitemporal history

use crate::core::temporal::{Timestamp, ValidInterval};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique record identifier, assigned when a write is proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new record ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One fact about a key: a value, the real-world range it holds for, and the
/// moment the store learned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    #[serde(default)]
    pub id: RecordId,
    pub key: String,
    pub value: Value,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
    /// Transaction time
    pub recorded_at: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl VersionedRecord {
    /// Create a record over `valid`, recorded at `recorded_at`
    pub fn new(key: impl Into<String>, value: Value, valid: ValidInterval, recorded_at: Timestamp) -> Self {
        Self {
            id: RecordId::new(),
            key: key.into(),
            value,
            valid_from: valid.from,
            valid_to: valid.to,
            recorded_at,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }

    /// Valid-time range of this record
    pub fn valid_interval(&self) -> ValidInterval {
        ValidInterval {
            from: self.valid_from,
            to: self.valid_to,
        }
    }

    /// Whether the record was known at `as_of` and holds at `valid_time`
    pub fn matches(&self, as_of: Timestamp, valid_time: Timestamp) -> bool {
        self.recorded_at <= as_of && self.valid_interval().contains(valid_time)
    }
}
