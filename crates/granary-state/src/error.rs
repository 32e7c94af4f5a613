//! Error types for Granary storage backends.

use thiserror::Error;

use crate::backend::Version;

/// Result type alias for storage operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    /// The stored version did not match the caller's expectation.
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("namespace {0} does not exist and resource creation is disabled")]
    NamespaceMissing(String),

    /// Transient failure talking to the backend. Safe to retry.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} did not finish within {timeout_ms}ms")]
    DeadlineExceeded { operation: &'static str, timeout_ms: u64 },

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StateError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
