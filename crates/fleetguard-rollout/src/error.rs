//! Rollout error taxonomy.
//!
//! External collaborators fail with [`ExternalError`]; the retry policy
//! decides from the variant whether another attempt is worthwhile.
//! Everything the orchestrator and runner surface is a [`RolloutError`].

use fleetguard_state::StateError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure reported by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request outright; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ExternalError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Errors surfaced by the orchestrator, resolver, and batch runner.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Lost a CAS or lease race to another operator.
    #[error("contention on {cluster_id}: {reason}")]
    Contention { cluster_id: String, reason: String },

    #[error("external call failed: {0}")]
    External(#[from] ExternalError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("batch {batch} cannot proceed: {reason}")]
    PrerequisitesUnmet { batch: String, reason: String },

    #[error("state store error: {0}")]
    State(StateError),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("lease lost on {0}")]
    LeaseLost(String),
}

impl From<StateError> for RolloutError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(id) => Self::NotFound(id),
            other => Self::State(other),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
