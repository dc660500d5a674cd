//! Replicated log: the ordered, agreed history of mutating operations

use crate::distributed::command::Command;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so entries from earlier terms can commit
    Noop,
    /// State machine operation
    Command(Command),
    /// Membership change: add a node
    Join { node_id: String, address: String },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term in which the entry was created
    pub term: u64,
    /// 1-based position in the log
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }
}

/// How the local log must change to accept a leader's entries
#[derive(Debug, Default, PartialEq)]
pub struct AppendPlan {
    /// First index of a conflicting suffix to drop
    pub truncate_from: Option<u64>,
    /// Entries to add after truncation
    pub new_entries: Vec<LogEntry>,
}

impl AppendPlan {
    pub fn is_noop(&self) -> bool {
        self.truncate_from.is_none() && self.new_entries.is_empty()
    }
}

/// In-memory log; entry `i` lives at `entries[i - 1]`
#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, which must be contiguous from index 1
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return Err(Error::Storage(format!(
                    "log gap: expected index {}, found {}",
                    pos + 1,
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of entry `index`; index 0 is the empty prefix with term 0
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Append a new entry at the end, as leader
    pub fn append(&mut self, term: u64, payload: EntryPayload) -> LogEntry {
        let entry = LogEntry::new(term, self.last_index() + 1, payload);
        self.entries.push(entry.clone());
        entry
    }

    /// Whether the local log contains an entry at `index` with `term`
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Entries `from..=last`, cloned
    pub fn entries_from(&self, from: u64) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        self.entries.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Entries `from..=to`, cloned
    pub fn range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from == 0 || from > to {
            return Vec::new();
        }
        let end = (to.min(self.last_index())) as usize;
        let start = from as usize - 1;
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Work out how to reconcile entries sent by the leader, which follow a
    /// matching prefix. Nothing is changed; see [`ReplicatedLog::apply_plan`].
    ///
    /// Entries already present with the same term are skipped; the first
    /// conflicting entry and everything after it are dropped. Committed
    /// entries are never dropped.
    pub fn plan_append(&self, incoming: &[LogEntry], commit_index: u64) -> Result<AppendPlan> {
        let mut plan = AppendPlan::default();
        let mut expected = None;
        for entry in incoming {
            if entry.index == 0 {
                return Err(Error::Distributed("log entries start at index 1".to_string()));
            }
            if let Some(next) = expected {
                if entry.index != next {
                    return Err(Error::Distributed(format!(
                        "non-contiguous entry {} where {} was expected",
                        entry.index, next
                    )));
                }
                plan.new_entries.push(entry.clone());
                expected = Some(next + 1);
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= commit_index {
                        return Err(Error::Distributed(format!(
                            "leader entry {} conflicts with committed entry",
                            entry.index
                        )));
                    }
                    plan.truncate_from = Some(entry.index);
                }
                None if entry.index != self.last_index() + 1 => {
                    return Err(Error::Distributed(format!(
                        "non-contiguous entry {} after {}",
                        entry.index,
                        self.last_index()
                    )));
                }
                None => {}
            }
            plan.new_entries.push(entry.clone());
            expected = Some(entry.index + 1);
        }
        Ok(plan)
    }

    /// Carry out a plan produced by [`ReplicatedLog::plan_append`]
    pub fn apply_plan(&mut self, plan: AppendPlan) {
        if let Some(from) = plan.truncate_from {
            self.entries.truncate((from - 1) as usize);
        }
        self.entries.extend(plan.new_entries);
    }

    /// Entries the log would hold after `plan`, used to rewrite storage
    pub fn preview(&self, plan: &AppendPlan) -> Vec<LogEntry> {
        let keep = plan
            .truncate_from
            .map(|from| (from - 1) as usize)
            .unwrap_or(self.entries.len());
        let mut out = self.entries[..keep].to_vec();
        out.extend(plan.new_entries.iter().cloned());
        out
    }
}
