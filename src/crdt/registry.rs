//! CRDT registry: per-key counters and registers behind a single RwLock

use crate::core::temporal::Timestamp;
use crate::crdt::types::{GCounter, LWWRegister, CRDT};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct RegistryState {
    counters: HashMap<String, GCounter>,
    registers: HashMap<String, LWWRegister>,
}

/// Holds every grow-only counter and LWW register of this replica
#[derive(Default)]
pub struct CrdtRegistry {
    state: RwLock<RegistryState>,
}

impl CrdtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `node_id`'s component of counter `key`.
    ///
    /// Fails with [`Error::InvalidDelta`] for negative deltas; nothing changes.
    pub async fn increment_counter(&self, key: &str, node_id: &str, delta: i64) -> Result<()> {
        if delta < 0 {
            return Err(Error::InvalidDelta { delta });
        }
        let mut state = self.state.write().await;
        let mut counter = state.counters.get(key).cloned().unwrap_or_default();
        counter.increment(node_id, delta)?;
        state.counters.insert(key.to_string(), counter);
        debug!(key, node_id, delta, "counter incremented");
        Ok(())
    }

    /// Total of counter `key`, zero if unknown
    pub async fn counter_value(&self, key: &str) -> u64 {
        let state = self.state.read().await;
        state.counters.get(key).map(GCounter::value).unwrap_or(0)
    }

    /// Copy of counter `key`, for shipping to a peer
    pub async fn counter(&self, key: &str) -> Option<GCounter> {
        self.state.read().await.counters.get(key).cloned()
    }

    /// Fold a remote replica's counter into ours
    pub async fn merge_counter(&self, key: &str, remote: &GCounter) {
        let mut state = self.state.write().await;
        state
            .counters
            .entry(key.to_string())
            .or_default()
            .merge(remote);
        debug!(key, "counter merged");
    }

    /// Store the write if `(timestamp, writer_id)` beats the current one.
    /// Returns whether the register changed.
    pub async fn set_register(&self, key: &str, value: Value, timestamp: Timestamp, writer_id: &str) -> bool {
        self.offer_register(key, LWWRegister::new(value, timestamp, writer_id))
            .await
    }

    /// Current value of register `key`
    pub async fn get_register(&self, key: &str) -> Option<Value> {
        let state = self.state.read().await;
        state.registers.get(key).map(|r| r.value().clone())
    }

    /// Copy of register `key`, for shipping to a peer
    pub async fn register(&self, key: &str) -> Option<LWWRegister> {
        self.state.read().await.registers.get(key).cloned()
    }

    /// Fold a remote replica's register into ours
    pub async fn merge_register(&self, key: &str, remote: &LWWRegister) -> bool {
        self.offer_register(key, remote.clone()).await
    }

    async fn offer_register(&self, key: &str, incoming: LWWRegister) -> bool {
        let mut state = self.state.write().await;
        match state.registers.get_mut(key) {
            Some(current) => {
                let before = current.clone();
                current.merge(&incoming);
                let changed = *current != before;
                if changed {
                    debug!(key, writer = incoming.writer_id(), "register replaced");
                }
                changed
            }
            None => {
                state.registers.insert(key.to_string(), incoming);
                true
            }
        }
    }
}
