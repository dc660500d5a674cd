//! Distributed systems components: the replicated command log, leader
//! election and replication, membership, and the transports nodes talk over.

pub mod command;
pub mod log;
pub mod membership;
pub mod raft;
pub mod rpc;
pub mod state_machine;
pub mod tcp;
pub mod transport;

pub use command::Command;
pub use log::{EntryPayload, LogEntry, ReplicatedLog};
pub use membership::Membership;
pub use raft::{NodeStatus, RaftConfig, RaftNode, Role};
pub use rpc::*;
pub use state_machine::{Applied, StateMachine};
pub use tcp::{RpcServer, TcpTransport};
pub use transport::{ClusterRouter, Transport};
