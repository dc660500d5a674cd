//! Transport seam between consensus nodes, plus an in-process router used to
//! drive multi-node clusters inside one test process.

use crate::distributed::raft::RaftNode;
use crate::distributed::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, JoinRequest, JoinResponse, VoteRequest, VoteResponse,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

/// Sends consensus RPCs to a peer, addressed by its network address
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse>;
}

/// Routes RPCs between nodes living in the same process.
///
/// Isolated addresses can neither send nor receive, which models a network
/// partition around that node.
#[derive(Default)]
pub struct ClusterRouter {
    nodes: DashMap<String, Weak<RaftNode>>,
    isolated: DashSet<String>,
}

impl ClusterRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport handle for the node at `local`
    pub fn transport(self: &Arc<Self>, local: impl Into<String>) -> Arc<dyn Transport> {
        Arc::new(RouterTransport {
            router: Arc::clone(self),
            local: local.into(),
        })
    }

    pub fn register(&self, address: impl Into<String>, node: &Arc<RaftNode>) {
        self.nodes.insert(address.into(), Arc::downgrade(node));
    }

    pub fn isolate(&self, address: &str) {
        self.isolated.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        self.isolated.remove(address);
    }

    pub fn heal_all(&self) {
        self.isolated.clear();
    }

    fn route(&self, from: &str, target: &str) -> Result<Arc<RaftNode>> {
        if self.isolated.contains(from) || self.isolated.contains(target) {
            return Err(Error::Distributed(format!("{target} unreachable from {from}")));
        }
        // clone out of the map so no shard lock is held across the call
        let node = self.nodes.get(target).map(|entry| entry.value().clone());
        node.and_then(|weak| weak.upgrade())
            .ok_or_else(|| Error::Distributed(format!("unknown peer {target}")))
    }
}

struct RouterTransport {
    router: Arc<ClusterRouter>,
    local: String,
}

#[async_trait]
impl Transport for RouterTransport {
    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        let node = self.router.route(&self.local, target)?;
        Ok(node.handle_request_vote(request).await)
    }

    async fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let node = self.router.route(&self.local, target)?;
        Ok(node.handle_append_entries(request).await)
    }

    async fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse> {
        let node = self.router.route(&self.local, target)?;
        Ok(node.handle_join(request).await)
    }
}
