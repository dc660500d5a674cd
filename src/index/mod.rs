//! Indexing for bitemporal queries

pub mod valid_time;

pub use valid_time::*;
