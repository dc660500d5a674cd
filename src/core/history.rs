//! KeyHistory: append-only sequence of records for one key

use crate::core::record::{RecordId, VersionedRecord};
use crate::core::temporal::Timestamp;
use crate::index::ValidTimeIndex;
use std::collections::HashSet;

/// Complete recorded history of a single key, in insertion order
#[derive(Debug, Clone, Default)]
pub struct KeyHistory {
    records: Vec<VersionedRecord>,
    index: ValidTimeIndex,
    ids: HashSet<RecordId>,
}

impl KeyHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history (and its index) from persisted records
    pub fn from_records(records: Vec<VersionedRecord>) -> Self {
        let mut history = Self::new();
        for record in records {
            history.append(record);
        }
        history
    }

    /// Append a record. Returns false if a record with the same id is already present.
    pub fn append(&mut self, record: VersionedRecord) -> bool {
        if !self.ids.insert(record.id) {
            return false;
        }
        self.index.add(record.valid_from, self.records.len());
        self.records.push(record);
        true
    }

    /// Remove the most recent record.
    ///
    /// Only used to undo an append whose persistence failed.
    pub(crate) fn undo_last(&mut self) -> Option<VersionedRecord> {
        let record = self.records.pop()?;
        self.ids.remove(&record.id);
        self.index.pop();
        Some(record)
    }

    /// The record visible at `(as_of, valid_time)`.
    ///
    /// Among all records known at `as_of` whose valid range contains
    /// `valid_time`, the most recently inserted wins.
    pub fn as_of(&self, as_of: Timestamp, valid_time: Timestamp) -> Option<&VersionedRecord> {
        self.index
            .candidates(valid_time)
            .map(|offset| &self.records[offset])
            .find(|record| record.matches(as_of, valid_time))
    }

    /// Records in insertion order
    pub fn records(&self) -> &[VersionedRecord] {
        &self.records
    }

    /// Last inserted record
    pub fn last(&self) -> Option<&VersionedRecord> {
        self.records.last()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// Persisted as a plain array of records; the index and id set are rebuilt on load.
impl serde::Serialize for KeyHistory {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.records.len()))?;
        for record in &self.records {
            seq.serialize_element(record)?;
        }
        seq.end()
    }
}

impl<'de> serde::Deserialize<'de> for KeyHistory {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let records = <Vec<VersionedRecord> as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self::from_records(records))
    }
}
