//! Chrono-DB: bitemporal database with replicated CRDTs
//!
//! A bitemporal key-value store whose writes are ordered by a replicated log,
//! alongside grow-only counters and last-writer-wins registers.
//!
//! # Core Concepts
//!
//! - **Valid time**: the real-world interval over which a value holds
//! - **Recorded time**: when the store learned the value; past knowledge stays queryable
//! - **CRDTs**: counters and registers whose merges converge in any order
//! - **Replicated log**: every write is committed by a majority before it is applied
//!
//! # Example
//!
//! ```no_run
//! use chrono_db::prelude::*;
//!
//! # async fn example() -> chrono_db::error::Result<()> {
//! let db = ChronoDb::in_memory().await?;
//!
//! let jan = Timestamp::from_ymd(2024, 1, 1).unwrap();
//! db.insert("price", 100, jan, Timestamp::END_OF_TIME).await?;
//!
//! let price = db.query_as_of("price", Timestamp::now(), jan).await;
//! assert_eq!(price, Some(serde_json::json!(100)));
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crdt;
pub mod distributed;
pub mod error;
pub mod index;
pub mod storage;

/// Main database type
pub mod db;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::core::*;
    pub use crate::crdt::{CrdtRegistry, GCounter, LWWRegister, CRDT};
    pub use crate::db::ChronoDb;
    pub use crate::distributed::{Command, NodeStatus, Role};
    pub use crate::error::{Error, Result};
}
