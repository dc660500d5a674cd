//! Replicated commands: the operations carried by the log

use crate::core::record::{RecordId, VersionedRecord};
use crate::core::temporal::{Timestamp, ValidInterval};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A mutating operation, applied to every replica in log order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Bitemporal insert. `id` and `recorded_at` are stamped by the proposer so
    /// every replica stores an identical record.
    Insert {
        id: RecordId,
        key: String,
        #[serde(with = "json_text")]
        value: Value,
        valid_from: Timestamp,
        valid_to: Timestamp,
        recorded_at: Timestamp,
        #[serde(with = "json_text")]
        metadata: BTreeMap<String, Value>,
    },
    /// Grow-only counter delta
    IncrementCounter {
        key: String,
        node_id: String,
        delta: i64,
    },
    /// LWW register write
    SetRegister {
        key: String,
        #[serde(with = "json_text")]
        value: Value,
        timestamp: Timestamp,
        writer_id: String,
    },
}

impl Command {
    /// Insert command recorded now
    pub fn insert(key: impl Into<String>, value: Value, valid_from: Timestamp, valid_to: Timestamp) -> Result<Self> {
        let valid = ValidInterval::new(valid_from, valid_to)?;
        Ok(Self::from_record(VersionedRecord::new(key, value, valid, Timestamp::now())))
    }

    /// Insert command carrying an already built record
    pub fn from_record(record: VersionedRecord) -> Self {
        Command::Insert {
            id: record.id,
            key: record.key,
            value: record.value,
            valid_from: record.valid_from,
            valid_to: record.valid_to,
            recorded_at: record.recorded_at,
            metadata: record.metadata,
        }
    }

    pub fn increment(key: impl Into<String>, node_id: impl Into<String>, delta: i64) -> Self {
        Command::IncrementCounter {
            key: key.into(),
            node_id: node_id.into(),
            delta,
        }
    }

    pub fn set_register(
        key: impl Into<String>,
        value: Value,
        timestamp: Timestamp,
        writer_id: impl Into<String>,
    ) -> Self {
        Command::SetRegister {
            key: key.into(),
            value,
            timestamp,
            writer_id: writer_id.into(),
        }
    }

    /// Reject commands that would violate a store invariant, before they reach the log
    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Insert {
                key,
                valid_from,
                valid_to,
                ..
            } => {
                validate_key(key)?;
                ValidInterval::new(*valid_from, *valid_to)?;
            }
            Command::IncrementCounter { key, node_id, delta } => {
                validate_key(key)?;
                if node_id.is_empty() {
                    return Err(Error::Validation("node id must not be empty".to_string()));
                }
                if *delta < 0 {
                    return Err(Error::InvalidDelta { delta: *delta });
                }
            }
            Command::SetRegister { key, writer_id, .. } => {
                validate_key(key)?;
                if writer_id.is_empty() {
                    return Err(Error::Validation("writer id must not be empty".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Insert { key, .. }
            | Command::IncrementCounter { key, .. }
            | Command::SetRegister { key, .. } => key,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Insert { .. } => "insert",
            Command::IncrementCounter { .. } => "increment_counter",
            Command::SetRegister { .. } => "set_register",
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("key must not be empty".to_string()));
    }
    Ok(())
}

/// Stores JSON values as text so non-self-describing codecs (bincode) can
/// carry them.
mod json_text {
    use serde::de::{DeserializeOwned, Error as _};
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        let text = serde_json::to_string(value).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: DeserializeOwned,
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation() {
        assert!(matches!(
            Command::increment("v", "n1", -2).validate(),
            Err(Error::InvalidDelta { delta: -2 })
        ));
        assert!(Command::increment("", "n1", 2).validate().unwrap_err().is_validation());
        assert!(Command::set_register("c", json!(1), Timestamp::EPOCH, "").validate().is_err());
        assert!(Command::insert("k", json!(1), Timestamp::from_secs(5), Timestamp::from_secs(5)).is_err());
        Command::increment("v", "n1", 0).validate().unwrap();
    }

    #[test]
    fn test_insert_survives_bincode() {
        let record = VersionedRecord::new(
            "k",
            json!({"price": 100, "tags": ["a", "b"]}),
            ValidInterval::open_ended(Timestamp::from_secs(0)).unwrap(),
            Timestamp::from_secs(42),
        )
        .with_metadata("source", json!("feed"));
        let command = Command::from_record(record);

        let bytes = bincode::serialize(&command).unwrap();
        let decoded: Command = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, command);
        assert_eq!(decoded.kind(), "insert");
        assert_eq!(decoded.key(), "k");
    }
}
