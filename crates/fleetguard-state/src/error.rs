//! Error types for the fleetguard state store.

use thiserror::Error;

use crate::types::ClusterStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// The backing database could not be opened, read, or committed.
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("cluster not found: {0}")]
    NotFound(String),

    #[error("cluster already registered: {0}")]
    AlreadyExists(String),

    /// The requested edge is not in the transition table.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ClusterStatus,
        to: ClusterStatus,
    },
}

impl StateError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
