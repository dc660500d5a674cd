//! Storage layer: history snapshots and the durable replication log

pub mod raft_log;
pub mod snapshot;

pub use raft_log::*;
pub use snapshot::*;
