//! Node configuration: JSON file with defaults, overridden by CLI flags

use crate::distributed::raft::RaftConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a node needs to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Directory holding the snapshot file and consensus state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the consensus RPC server binds and advertises
    #[serde(default = "default_raft_addr")]
    pub raft_addr: String,

    /// Initial cluster members other than this node (id -> address)
    #[serde(default)]
    pub peers: BTreeMap<String, String>,

    /// Existing members to ask for admission (id -> address)
    #[serde(default)]
    pub join: BTreeMap<String, String>,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Keep records and consensus state on disk
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_node_id() -> String {
    "node1".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_raft_addr() -> String {
    "127.0.0.1:7001".to_string()
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    500
}

fn default_election_timeout_max_ms() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    250
}

fn default_persist() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            raft_addr: default_raft_addr(),
            peers: BTreeMap::new(),
            join: BTreeMap::new(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            persist: default_persist(),
        }
    }
}

/// Values given on the command line; `None` keeps the file or default value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub node_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub raft_addr: Option<String>,
    pub peers: Vec<(String, String)>,
    pub join: Vec<(String, String)>,
    pub in_memory: bool,
}

impl NodeConfig {
    /// Single-node, non-persistent configuration
    pub fn in_memory(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            persist: false,
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref node_id) = overrides.node_id {
            self.node_id = node_id.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(ref raft_addr) = overrides.raft_addr {
            self.raft_addr = raft_addr.clone();
        }
        for (id, addr) in &overrides.peers {
            self.peers.insert(id.clone(), addr.clone());
        }
        for (id, addr) in &overrides.join {
            self.join.insert(id.clone(), addr.clone());
        }
        if overrides.in_memory {
            self.persist = false;
        }
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Configuration("node_id must not be empty".to_string()));
        }
        if self.raft_addr.is_empty() {
            return Err(Error::Configuration("raft_addr must not be empty".to_string()));
        }
        if self.persist && self.data_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("data_dir is required when persist is on".to_string()));
        }
        for (name, value) in [
            ("tick_interval_ms", self.tick_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("election_timeout_min_ms", self.election_timeout_min_ms),
            ("rpc_timeout_ms", self.rpc_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(Error::Configuration(format!(
                "election_timeout_min_ms ({}) exceeds election_timeout_max_ms ({})",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(Error::Configuration(
                "heartbeat_interval_ms must be below election_timeout_min_ms".to_string(),
            ));
        }
        // a peer that stops answering holds its request open this long
        if self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return Err(Error::Configuration(format!(
                "rpc_timeout_ms ({}) must be below election_timeout_min_ms ({})",
                self.rpc_timeout_ms, self.election_timeout_min_ms
            )));
        }
        for (id, addr) in self.peers.iter().chain(self.join.iter()) {
            if id == &self.node_id {
                return Err(Error::Configuration(format!("node {id} lists itself as a peer")));
            }
            if id.is_empty() || addr.is_empty() {
                return Err(Error::Configuration("peer id and address must not be empty".to_string()));
            }
        }
        if !self.peers.is_empty() && !self.join.is_empty() {
            return Err(Error::Configuration(
                "use either peers (founding member) or join (new member), not both".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Consensus settings derived from this configuration
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            node_id: self.node_id.clone(),
            address: self.raft_addr.clone(),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            await_leader: !self.join.is_empty(),
        }
    }
}

/// Parse an `ID=ADDR` pair from the command line
pub fn parse_member(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((id, addr)) if !id.is_empty() && !addr.is_empty() => Ok((id.to_string(), addr.to_string())),
        _ => Err(format!("expected ID=ADDR, got '{s}'")),
    }
}
