//! Durable consensus state: hard state (term, vote, applied index) and log entries.
//!
//! Log file format: a sequence of frames, each
//! `[len: u32 BE][crc32 of payload: u32 BE][payload: bincode LogEntry]`.
//! A torn or corrupt trailing frame (crash mid-append) is dropped on load.

use crate::distributed::log::LogEntry;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory under the data dir holding consensus state
pub const RAFT_DIR: &str = "raft";
/// Hard state file name
pub const HARD_STATE_FILE: &str = "hard_state.json";
/// Log file name
pub const LOG_FILE: &str = "log.bin";

const FRAME_HEADER_SIZE: usize = 8;

/// State that must survive a restart for elections to stay safe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    /// Highest log index whose effects are already in the state machine
    pub last_applied: u64,
}

/// Trait for consensus state persistence
pub trait LogStore: Send {
    /// Read back the hard state and every log entry
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)>;

    /// Durably replace the hard state
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Durably append entries at the end of the log
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Replace the whole log, used after a conflicting suffix was removed
    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()>;
}

/// Volatile store for tests and non-durable nodes
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    hard_state: HardState,
    entries: Vec<LogEntry>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for InMemoryLogStore {
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)> {
        Ok((self.hard_state.clone(), self.entries.clone()))
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        Ok(())
    }
}

/// File-backed store under `<data_dir>/raft/`
pub struct FileLogStore {
    hard_state_path: PathBuf,
    log_path: PathBuf,
    log_file: Option<File>,
}

impl FileLogStore {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref().join(RAFT_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            hard_state_path: dir.join(HARD_STATE_FILE),
            log_path: dir.join(LOG_FILE),
            log_file: None,
        })
    }

    /// Read only the hard state, without touching the log
    pub fn read_hard_state(&self) -> Result<HardState> {
        match fs::read(&self.hard_state_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn append_handle(&mut self) -> Result<&mut File> {
        if self.log_file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            self.log_file = Some(file);
        }
        self.log_file
            .as_mut()
            .ok_or_else(|| Error::Storage("log file not open".to_string()))
    }
}

impl LogStore for FileLogStore {
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)> {
        let hard_state = self.read_hard_state()?;

        let bytes = match fs::read(&self.log_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (entries, valid_len) = decode_frames(&bytes);
        if valid_len < bytes.len() {
            warn!(
                path = %self.log_path.display(),
                dropped_bytes = bytes.len() - valid_len,
                "discarding torn tail of consensus log"
            );
            let file = OpenOptions::new().write(true).open(&self.log_path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        debug!(entries = entries.len(), term = hard_state.current_term, "consensus state loaded");
        Ok((hard_state, entries))
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let tmp = self.hard_state_path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(state)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.hard_state_path)?;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = encode_frames(entries)?;
        let file = self.append_handle()?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.log_file = None;
        let tmp = self.log_path.with_extension("bin.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&encode_frames(entries)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.log_path)?;
        Ok(())
    }
}

fn encode_frames(entries: &[LogEntry]) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    for entry in entries {
        let payload = bincode::serialize(entry)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Storage(format!("log entry {} too large", entry.index)))?;
        buf.put_u32(len);
        buf.put_u32(crc32fast::hash(&payload));
        buf.put_slice(&payload);
    }
    Ok(buf)
}

/// Decode frames until the first incomplete or corrupt one.
/// Returns the entries and the byte length of the valid prefix.
fn decode_frames(bytes: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut buf = bytes;
    let mut consumed = 0;
    while buf.remaining() >= FRAME_HEADER_SIZE {
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let len = header.get_u32() as usize;
        let crc = header.get_u32();
        if buf.len() < FRAME_HEADER_SIZE + len {
            break;
        }
        let payload = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match bincode::deserialize::<LogEntry>(payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        buf.advance(FRAME_HEADER_SIZE + len);
        consumed += FRAME_HEADER_SIZE + len;
    }
    (entries, consumed)
}
