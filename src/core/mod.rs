//! Core data types and the bitemporal store

pub mod history;
pub mod record;
pub mod store;
pub mod temporal;

pub use history::*;
pub use record::*;
pub use store::*;
pub use temporal::*;
