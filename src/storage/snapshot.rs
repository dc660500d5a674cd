//! Persistence for the key-history map.
//!
//! The whole map is written on every insert and on shutdown, and read once at
//! startup. Implementations must make each save atomic: a crash mid-write
//! leaves the previous snapshot intact.

use crate::core::history::KeyHistory;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// File name of the JSON snapshot inside the data directory
pub const SNAPSHOT_FILE: &str = "chrono_db.json";

/// Trait for key-history persistence implementations
#[cfg_attr(test, mockall::automock)]
pub trait HistoryPersistence: Send + Sync {
    /// Load the persisted map, empty if nothing was saved yet
    fn load(&self) -> Result<HashMap<String, KeyHistory>>;

    /// Atomically replace the persisted map
    fn save(&self, histories: &HashMap<String, KeyHistory>) -> Result<()>;
}

/// Pretty-printed JSON file, replaced via write-to-temp and rename
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    /// Persist into `<dir>/chrono_db.json`, creating `dir` if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryPersistence for JsonFilePersistence {
    fn load(&self) -> Result<HashMap<String, KeyHistory>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to open {}: {e}",
                    self.path.display()
                )))
            }
        };
        let histories: HashMap<String, KeyHistory> = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), keys = histories.len(), "loaded snapshot");
        Ok(histories)
    }

    fn save(&self, histories: &HashMap<String, KeyHistory>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let file = File::create(&tmp)
            .map_err(|e| Error::Storage(format!("failed to create {}: {e}", tmp.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, histories)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::Storage(e.to_string()))?
            .sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Keeps the last snapshot in memory; for tests and non-durable nodes
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryPersistence for InMemoryPersistence {
    fn load(&self) -> Result<HashMap<String, KeyHistory>> {
        let guard = self
            .snapshot
            .lock()
            .map_err(|_| Error::Storage("snapshot lock poisoned".to_string()))?;
        match guard.as_deref() {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => Ok(HashMap::new()),
        }
    }

    fn save(&self, histories: &HashMap<String, KeyHistory>) -> Result<()> {
        let bytes = serde_json::to_vec(histories)?;
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| Error::Storage("snapshot lock poisoned".to_string()))?;
        *guard = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::VersionedRecord;
    use crate::core::temporal::{Timestamp, ValidInterval};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> HashMap<String, KeyHistory> {
        let valid = ValidInterval::open_ended(Timestamp::from_secs(0)).unwrap();
        let mut history = KeyHistory::new();
        history.append(VersionedRecord::new("p", json!(100), valid, Timestamp::from_secs(1)));
        history.append(VersionedRecord::new("p", json!(200), valid, Timestamp::from_secs(2)));
        HashMap::from([("p".to_string(), history)])
    }

    #[test]
    fn test_json_file_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path()).unwrap();
        assert!(store.load().unwrap().is_empty());

        store.save(&sample()).unwrap();
        assert!(!dir.path().join("chrono_db.json.tmp").exists());

        let loaded = store.load().unwrap();
        let values: Vec<_> = loaded["p"].records().iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![json!(100), json!(200)]);
    }

    #[test]
    fn test_file_layout_is_map_of_record_arrays() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path()).unwrap();
        store.save(&sample()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["p"].as_array().unwrap().len(), 2);
        assert_eq!(raw["p"][1]["value"], json!(200));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"{not json").unwrap();
        let store = JsonFilePersistence::new(dir.path()).unwrap();
        assert!(store.load().unwrap_err().is_storage());
    }

    #[test]
    fn test_in_memory_round_trip() {
        let store = InMemoryPersistence::new();
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap()["p"].len(), 2);
    }
}
