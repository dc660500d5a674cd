//! Error types for Chrono-DB

use crate::core::temporal::Timestamp;
use thiserror::Error;

/// Result type alias for Chrono-DB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Chrono-DB
#[derive(Error, Debug)]
pub enum Error {
    /// Negative delta passed to a grow-only counter
    #[error("Invalid delta: counter increments must be non-negative, got {delta}")]
    InvalidDelta { delta: i64 },

    /// Valid-time interval that is empty or inverted
    #[error("Invalid interval: valid_from {valid_from} must be before valid_to {valid_to}")]
    InvalidInterval {
        valid_from: Timestamp,
        valid_to: Timestamp,
    },

    /// Other rejected input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Write submitted to a node that is not the leader
    #[error("Not leader{}", .leader.as_ref().map(|l| format!(" (current leader: {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    /// Entry appended but not acknowledged by a majority
    #[error("Entry {index} was not committed by a majority")]
    NotCommitted { index: u64 },

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Distributed system errors
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors raised before any state change because the input was invalid.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidDelta { .. } | Error::InvalidInterval { .. } | Error::Validation(_)
        )
    }

    /// True for persistence failures.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::InvalidDelta { delta: -1 }.is_validation());
        assert!(Error::Validation("x".into()).is_validation());
        assert!(!Error::NotLeader { leader: None }.is_validation());
        assert!(Error::Storage("disk".into()).is_storage());
        assert!(!Error::NotCommitted { index: 3 }.is_storage());
    }

    #[test]
    fn test_not_leader_message() {
        let err = Error::NotLeader {
            leader: Some("n2".to_string()),
        };
        assert_eq!(err.to_string(), "Not leader (current leader: n2)");
        assert_eq!(Error::NotLeader { leader: None }.to_string(), "Not leader");
    }
}
