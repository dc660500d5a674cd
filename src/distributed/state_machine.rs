//! Applies committed log entries to the temporal store and CRDT registry

use crate::core::record::VersionedRecord;
use crate::core::store::TemporalStore;
use crate::crdt::registry::CrdtRegistry;
use crate::distributed::command::Command;
use crate::distributed::log::{EntryPayload, LogEntry};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Side effect of an applied entry that the consensus layer must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Nothing,
    MemberAdded { node_id: String, address: String },
}

/// Deterministic state machine fed by the replicated log
pub struct StateMachine {
    store: Arc<TemporalStore>,
    registry: Arc<CrdtRegistry>,
    last_applied: u64,
}

impl StateMachine {
    pub fn new(store: Arc<TemporalStore>, registry: Arc<CrdtRegistry>) -> Self {
        Self {
            store,
            registry,
            last_applied: 0,
        }
    }

    /// Resume after a restart: entries up to `index` are already reflected
    pub fn with_last_applied(mut self, index: u64) -> Self {
        self.last_applied = index;
        self
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn store(&self) -> &Arc<TemporalStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CrdtRegistry> {
        &self.registry
    }

    /// Apply the next entry. Entries must arrive in order, each exactly once.
    ///
    /// A storage failure leaves `last_applied` unchanged so the entry is
    /// retried. A command rejected by validation is skipped: every replica
    /// rejects it the same way.
    pub async fn apply(&mut self, entry: &LogEntry) -> Result<Applied> {
        if entry.index != self.last_applied + 1 {
            return Err(Error::Distributed(format!(
                "out of order apply: entry {} after {}",
                entry.index, self.last_applied
            )));
        }

        let applied = match &entry.payload {
            EntryPayload::Noop => Applied::Nothing,
            EntryPayload::Join { node_id, address } => Applied::MemberAdded {
                node_id: node_id.clone(),
                address: address.clone(),
            },
            EntryPayload::Command(command) => match self.apply_command(command).await {
                Ok(()) => Applied::Nothing,
                Err(e) if e.is_validation() => {
                    warn!(index = entry.index, kind = command.kind(), error = %e, "skipping rejected command");
                    Applied::Nothing
                }
                Err(e) => return Err(e),
            },
        };

        self.last_applied = entry.index;
        debug!(index = entry.index, term = entry.term, "entry applied");
        Ok(applied)
    }

    async fn apply_command(&self, command: &Command) -> Result<()> {
        match command {
            Command::Insert {
                id,
                key,
                value,
                valid_from,
                valid_to,
                recorded_at,
                metadata,
            } => {
                let record = VersionedRecord {
                    id: *id,
                    key: key.clone(),
                    value: value.clone(),
                    valid_from: *valid_from,
                    valid_to: *valid_to,
                    recorded_at: *recorded_at,
                    metadata: metadata.clone(),
                };
                if !self.store.insert_record(record).await? {
                    debug!(%id, key = %key, "insert already applied");
                }
                Ok(())
            }
            Command::IncrementCounter { key, node_id, delta } => {
                self.registry.increment_counter(key, node_id, *delta).await
            }
            Command::SetRegister {
                key,
                value,
                timestamp,
                writer_id,
            } => {
                self.registry
                    .set_register(key, value.clone(), *timestamp, writer_id)
                    .await;
                Ok(())
            }
        }
    }
}
