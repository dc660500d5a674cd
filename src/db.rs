//! Main database implementation

use crate::config::NodeConfig;
use crate::core::record::VersionedRecord;
use crate::core::store::TemporalStore;
use crate::core::temporal::{Timestamp, ValidInterval};
use crate::crdt::registry::CrdtRegistry;
use crate::crdt::types::{GCounter, LWWRegister};
use crate::distributed::command::Command;
use crate::distributed::membership::Membership;
use crate::distributed::raft::{NodeStatus, RaftNode};
use crate::distributed::state_machine::StateMachine;
use crate::distributed::tcp::{RpcServer, TcpTransport};
use crate::distributed::transport::{ClusterRouter, Transport};
use crate::error::{Error, Result};
use crate::storage::raft_log::{FileLogStore, InMemoryLogStore, LogStore};
use crate::storage::snapshot::JsonFilePersistence;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One database node: bitemporal store, CRDT registry and the consensus
/// node that orders every write.
///
/// Writes go through the replicated log and fail with [`Error::NotLeader`]
/// on followers. Reads are served from local state.
pub struct ChronoDb {
    node_id: String,
    store: Arc<TemporalStore>,
    registry: Arc<CrdtRegistry>,
    raft: Arc<RaftNode>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ChronoDb {
    /// Open a networked node: restore state from `data_dir`, serve consensus
    /// RPCs on `raft_addr`, start the timers and, if configured, ask an
    /// existing member for admission.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let server = RpcServer::bind(&config.raft_addr).await?;
        let mut config = config;
        if config.raft_addr.ends_with(":0") {
            // advertise the port actually bound
            config.raft_addr = server.local_addr()?.to_string();
        }

        let transport = Arc::new(TcpTransport::new(config.rpc_timeout()));
        let db = Self::assemble(&config, transport).await?;
        let handle = tokio::spawn(server.serve(Arc::clone(&db.raft), db.raft.cancellation_token()));
        *db.server.lock().await = Some(handle);

        db.raft.start().await?;
        if !config.join.is_empty() {
            if let Err(e) = db.join_existing(&config).await {
                db.shutdown().await?;
                return Err(e);
            }
        }
        info!(node = %config.node_id, addr = %config.raft_addr, persist = config.persist, "node started");
        Ok(db)
    }

    /// Single-node database without networking or persistence
    pub async fn in_memory() -> Result<Self> {
        let config = NodeConfig::in_memory("local");
        let router = ClusterRouter::new();
        let db = Self::with_transport(config, router.transport("local")).await?;
        db.raft.start().await?;
        Ok(db)
    }

    /// Build a node on a caller-supplied transport. The node is not started;
    /// call [`ChronoDb::raft`] and `start` once the transport can reach it.
    pub async fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Self::assemble(&config, transport).await
    }

    async fn assemble(config: &NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let (store, log_store): (TemporalStore, Box<dyn LogStore>) = if config.persist {
            let persistence = Arc::new(JsonFilePersistence::new(&config.data_dir)?);
            (
                TemporalStore::open(persistence)?,
                Box::new(FileLogStore::open(&config.data_dir)?),
            )
        } else {
            (TemporalStore::in_memory(), Box::new(InMemoryLogStore::new()))
        };
        let store = Arc::new(store);
        let registry = Arc::new(CrdtRegistry::new());

        let membership = Membership::with_peers(config.node_id.clone(), config.peers.clone());
        let raft = RaftNode::open(
            config.raft_config(),
            membership,
            log_store,
            StateMachine::new(Arc::clone(&store), Arc::clone(&registry)),
            transport,
        )
        .await?;

        Ok(Self {
            node_id: config.node_id.clone(),
            store,
            registry,
            raft,
            server: Mutex::new(None),
        })
    }

    async fn join_existing(&self, config: &NodeConfig) -> Result<()> {
        let mut last_error = None;
        for (id, address) in &config.join {
            match self.raft.request_join(address).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(via = %id, %address, error = %e, "join attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Distributed("no member to join through".to_string())))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Consensus node, for wiring transports and inspecting state
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Record that `key` holds `value` over `[valid_from, valid_to)`, as
    /// learned now. Returns the stored record.
    pub async fn insert<V: Serialize>(
        &self,
        key: &str,
        value: V,
        valid_from: Timestamp,
        valid_to: Timestamp,
    ) -> Result<VersionedRecord> {
        let value = serde_json::to_value(value)?;
        let valid = ValidInterval::new(valid_from, valid_to)?;
        let record = VersionedRecord::new(key, value, valid, Timestamp::now());
        self.apply(Command::from_record(record.clone())).await?;

        // the store may have moved recorded_at forward to keep it monotonic
        let stored = self
            .store
            .history(key)
            .await
            .into_iter()
            .rev()
            .find(|r| r.id == record.id);
        Ok(stored.unwrap_or(record))
    }

    /// Value of `key` at `valid_time`, as known at `as_of`
    pub async fn query_as_of(&self, key: &str, as_of: Timestamp, valid_time: Timestamp) -> Option<Value> {
        self.store.query_as_of(key, as_of, valid_time).await
    }

    /// Whole record matching `query_as_of`
    pub async fn record_as_of(&self, key: &str, as_of: Timestamp, valid_time: Timestamp) -> Option<VersionedRecord> {
        self.store.record_as_of(key, as_of, valid_time).await
    }

    pub async fn query_current(&self, key: &str) -> Option<Value> {
        self.store.query_current(key).await
    }

    /// Every record of `key` in insertion order
    pub async fn history(&self, key: &str) -> Vec<VersionedRecord> {
        self.store.history(key).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.keys().await
    }

    /// Add `delta` to this node's component of counter `key`
    pub async fn increment_counter(&self, key: &str, delta: i64) -> Result<()> {
        self.apply(Command::increment(key, self.node_id.clone(), delta)).await?;
        Ok(())
    }

    pub async fn counter_value(&self, key: &str) -> u64 {
        self.registry.counter_value(key).await
    }

    pub async fn counter(&self, key: &str) -> Option<GCounter> {
        self.registry.counter(key).await
    }

    /// Write register `key`, stamped now by this node
    pub async fn set_register<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.apply(Command::set_register(key, value, Timestamp::now(), self.node_id.clone()))
            .await?;
        Ok(())
    }

    pub async fn get_register(&self, key: &str) -> Option<Value> {
        self.registry.get_register(key).await
    }

    pub async fn register(&self, key: &str) -> Option<LWWRegister> {
        self.registry.register(key).await
    }

    /// Fold a counter received from another replica into the local one
    pub async fn merge_counter(&self, key: &str, remote: &GCounter) {
        self.registry.merge_counter(key, remote).await
    }

    /// Fold a register received from another replica; true if it won
    pub async fn merge_register(&self, key: &str, remote: &LWWRegister) -> bool {
        self.registry.merge_register(key, remote).await
    }

    /// Replicate an arbitrary command; returns its log index once applied
    pub async fn apply(&self, command: Command) -> Result<u64> {
        self.raft.apply(command).await
    }

    /// Role name and current term
    pub async fn get_state(&self) -> (String, u64) {
        self.raft.get_state().await
    }

    /// Admit a node into the cluster (leader only)
    pub async fn join(&self, node_id: &str, address: &str) -> Result<u64> {
        self.raft.join(node_id, address).await
    }

    pub async fn status(&self) -> NodeStatus {
        self.raft.status().await
    }

    /// Stop timers and the RPC server, then flush records to disk
    pub async fn shutdown(&self) -> Result<()> {
        self.raft.shutdown().await;
        let server = self.server.lock().await.take();
        if let Some(handle) = server {
            if let Err(e) = handle.await {
                warn!(error = %e, "rpc server ended abnormally");
            }
        }
        self.store.flush().await?;
        info!(node = %self.node_id, "node shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn ymd(y: i32, m: u32, d: u32) -> Timestamp {
        Timestamp::from_ymd(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_price_scenario() {
        let db = ChronoDb::in_memory().await.unwrap();
        assert_eq!(db.get_state().await.0, "leader");

        db.insert("price", 100, ymd(2024, 1, 1), ymd(2024, 7, 1)).await.unwrap();
        db.insert("price", 200, ymd(2024, 7, 1), Timestamp::END_OF_TIME).await.unwrap();

        let now = Timestamp::now();
        assert_eq!(db.query_as_of("price", now, ymd(2024, 3, 1)).await, Some(json!(100)));
        assert_eq!(db.query_as_of("price", now, ymd(2024, 8, 1)).await, Some(json!(200)));
        assert_eq!(db.query_as_of("price", now, ymd(2023, 8, 1)).await, None);
        assert_eq!(db.history("price").await.len(), 2);
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_correction_is_invisible_to_earlier_as_of() {
        let db = ChronoDb::in_memory().await.unwrap();
        let first = db.insert("rate", 1.5, ymd(2024, 1, 1), Timestamp::END_OF_TIME).await.unwrap();
        let correction = db.insert("rate", 1.7, ymd(2024, 1, 1), Timestamp::END_OF_TIME).await.unwrap();
        assert!(correction.recorded_at >= first.recorded_at);

        let before = correction.recorded_at.sub_micros(1);
        if before >= first.recorded_at {
            assert_eq!(db.query_as_of("rate", before, ymd(2024, 2, 1)).await, Some(json!(1.5)));
        }
        assert_eq!(db.query_current("rate").await, Some(json!(1.7)));
    }

    #[tokio::test]
    async fn test_invalid_writes_change_nothing() {
        let db = ChronoDb::in_memory().await.unwrap();
        let err = db.insert("k", 1, ymd(2024, 2, 1), ymd(2024, 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInterval { .. }));
        let err = db.increment_counter("v", -1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDelta { delta: -1 }));
        assert!(db.history("k").await.is_empty());
        assert_eq!(db.counter_value("v").await, 0);
    }

    #[tokio::test]
    async fn test_crdt_operations() {
        let db = ChronoDb::in_memory().await.unwrap();
        db.increment_counter("v", 3).await.unwrap();
        db.merge_counter("v", &GCounter::from_counts([("n2", 5u64)])).await;
        assert_eq!(db.counter_value("v").await, 8);

        db.set_register("c", "red").await.unwrap();
        let stale = LWWRegister::new(json!("blue"), Timestamp::from_secs(5), "n2");
        assert!(!db.merge_register("c", &stale).await);
        assert_eq!(db.get_register("c").await, Some(json!("red")));
    }

    #[tokio::test]
    async fn test_reopen_restores_records_and_counters() {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig::default();
        config.node_id = "n1".into();
        config.data_dir = dir.path().to_path_buf();
        config.raft_addr = "127.0.0.1:0".into();

        {
            let db = ChronoDb::open(config.clone()).await.unwrap();
            db.insert("k", json!({"a": 1}), ymd(2024, 1, 1), Timestamp::END_OF_TIME).await.unwrap();
            db.increment_counter("v", 2).await.unwrap();
            db.shutdown().await.unwrap();
        }

        let db = ChronoDb::open(config).await.unwrap();
        assert_eq!(db.query_current("k").await, Some(json!({"a": 1})));
        assert_eq!(db.history("k").await.len(), 1);
        assert_eq!(db.counter_value("v").await, 2);
        assert!(dir.path().join(crate::storage::snapshot::SNAPSHOT_FILE).exists());
        db.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_on_follower_are_redirected() {
        let router = ClusterRouter::new();
        let mut dbs = Vec::new();
        for id in ["n1", "n2", "n3"] {
            let mut config = NodeConfig::in_memory(id);
            config.raft_addr = id.to_string();
            config.election_timeout_min_ms = 60_000;
            config.election_timeout_max_ms = 120_000;
            for peer in ["n1", "n2", "n3"].into_iter().filter(|p| *p != id) {
                config.peers.insert(peer.to_string(), peer.to_string());
            }
            let db = ChronoDb::with_transport(config, router.transport(id)).await.unwrap();
            router.register(id, db.raft());
            dbs.push(db);
        }
        dbs[0].raft().campaign().await.unwrap();

        dbs[0].insert("k", "v", ymd(2024, 1, 1), Timestamp::END_OF_TIME).await.unwrap();
        let err = dbs[1].increment_counter("v", 1).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader { leader: Some(ref l) } if l == "n1"));

        dbs[0].raft().heartbeat().await;
        for db in &dbs {
            assert_eq!(db.query_current("k").await, Some(json!("v")));
        }
        assert_eq!(dbs[2].status().await.leader_id.as_deref(), Some("n1"));
    }
}
