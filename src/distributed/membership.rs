//! Cluster membership: who votes and who receives heartbeats

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// This node plus its peers (node id -> address)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    local_id: String,
    peers: BTreeMap<String, String>,
}

impl Membership {
    /// Membership containing only `local_id`
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: BTreeMap::new(),
        }
    }

    /// Membership with an initial peer set; an entry for `local_id` is ignored
    pub fn with_peers<I, K, V>(local_id: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut membership = Self::new(local_id);
        for (id, addr) in peers {
            membership.add(id.into(), addr.into());
        }
        membership
    }

    /// Add or re-address a node. Returns true if the voter set grew.
    pub fn add(&mut self, node_id: String, address: String) -> bool {
        if node_id == self.local_id {
            return false;
        }
        self.peers.insert(node_id, address).is_none()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peers(&self) -> &BTreeMap<String, String> {
        &self.peers
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        node_id == self.local_id || self.peers.contains_key(node_id)
    }

    /// Number of voting members, including this node
    pub fn size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Votes or acknowledgments needed for a majority
    pub fn quorum(&self) -> usize {
        self.size() / 2 + 1
    }

    pub fn is_single_node(&self) -> bool {
        self.peers.is_empty()
    }
}
