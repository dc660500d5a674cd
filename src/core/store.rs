//! Temporal store: per-key bitemporal histories behind a single RwLock

use crate::core::history::KeyHistory;
use crate::core::record::VersionedRecord;
use crate::core::temporal::{Timestamp, ValidInterval};
use crate::error::{Error, Result};
use crate::storage::{HistoryPersistence, InMemoryPersistence};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bitemporal record store.
///
/// Reads share the lock; an insert holds it exclusively through both the
/// in-memory append and the snapshot write, so no reader ever observes a
/// record whose persistence failed.
pub struct TemporalStore {
    histories: RwLock<HashMap<String, KeyHistory>>,
    persistence: Arc<dyn HistoryPersistence>,
}

impl TemporalStore {
    /// Open a store, loading whatever `persistence` holds
    pub fn open(persistence: Arc<dyn HistoryPersistence>) -> Result<Self> {
        let histories = persistence.load()?;
        debug!(keys = histories.len(), "temporal store opened");
        Ok(Self {
            histories: RwLock::new(histories),
            persistence,
        })
    }

    /// Create a store that keeps its snapshot in memory
    pub fn in_memory() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            persistence: Arc::new(InMemoryPersistence::new()),
        }
    }

    /// Record `value` for `key` over `[valid_from, valid_to)`, known from now on
    pub async fn insert(
        &self,
        key: &str,
        value: Value,
        valid_from: Timestamp,
        valid_to: Timestamp,
    ) -> Result<VersionedRecord> {
        let valid = ValidInterval::new(valid_from, valid_to)?;
        let record = VersionedRecord::new(key, value, valid, Timestamp::now());
        let mut histories = self.histories.write().await;
        self.append_locked(&mut histories, record)?
            .ok_or_else(|| Error::Storage(format!("record id collision for key {key}")))
    }

    /// Append a pre-built record, e.g. one replayed from the replicated log.
    ///
    /// Returns `false` without touching anything when a record with the same
    /// id is already stored.
    pub async fn insert_record(&self, record: VersionedRecord) -> Result<bool> {
        ValidInterval::new(record.valid_from, record.valid_to)?;
        let mut histories = self.histories.write().await;
        Ok(self.append_locked(&mut histories, record)?.is_some())
    }

    fn append_locked(
        &self,
        histories: &mut HashMap<String, KeyHistory>,
        mut record: VersionedRecord,
    ) -> Result<Option<VersionedRecord>> {
        let history = histories.entry(record.key.clone()).or_default();
        if history.contains(&record.id) {
            debug!(key = %record.key, id = %record.id, "record already stored");
            return Ok(None);
        }
        // transaction time never runs backwards within a key
        if let Some(last) = history.last() {
            if record.recorded_at < last.recorded_at {
                record.recorded_at = last.recorded_at;
            }
        }
        let key = record.key.clone();
        history.append(record.clone());

        if let Err(e) = self.persistence.save(histories) {
            warn!(key = %key, error = %e, "persisting insert failed, rolling back");
            if let Some(history) = histories.get_mut(&key) {
                history.undo_last();
                if history.is_empty() {
                    histories.remove(&key);
                }
            }
            return Err(e);
        }
        debug!(key = %key, recorded_at = %record.recorded_at, "record inserted");
        Ok(Some(record))
    }

    /// Value valid at `valid_time` as known at `as_of`; `None` if nothing matches
    pub async fn query_as_of(&self, key: &str, as_of: Timestamp, valid_time: Timestamp) -> Option<Value> {
        self.record_as_of(key, as_of, valid_time)
            .await
            .map(|record| record.value)
    }

    /// Whole record valid at `valid_time` as known at `as_of`
    pub async fn record_as_of(
        &self,
        key: &str,
        as_of: Timestamp,
        valid_time: Timestamp,
    ) -> Option<VersionedRecord> {
        let histories = self.histories.read().await;
        histories
            .get(key)
            .and_then(|history| history.as_of(as_of, valid_time))
            .cloned()
    }

    /// Value valid now, as known now
    pub async fn query_current(&self, key: &str) -> Option<Value> {
        let now = Timestamp::now();
        self.query_as_of(key, now, now).await
    }

    /// Copy of every record for `key` in insertion order
    pub async fn history(&self, key: &str) -> Vec<VersionedRecord> {
        let histories = self.histories.read().await;
        histories
            .get(key)
            .map(|history| history.records().to_vec())
            .unwrap_or_default()
    }

    /// All known keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let histories = self.histories.read().await;
        let mut keys: Vec<String> = histories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of keys with at least one record
    pub async fn len(&self) -> usize {
        self.histories.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.histories.read().await.is_empty()
    }

    /// Write the current state through to persistence
    pub async fn flush(&self) -> Result<()> {
        let histories = self.histories.write().await;
        self.persistence.save(&histories)
    }
}
