use thiserror::Error;

use granary_state::StateError;

use crate::key::ETag;

pub type GrainResult<T> = Result<T, GrainStorageError>;

#[derive(Debug, Error)]
pub enum GrainStorageError {
    /// The stored eTag is not the one the caller supplied. Read and retry.
    #[error("etag conflict on {key}: expected {}, stored {}", show(.expected), show(.actual))]
    Conflict {
        key: String,
        expected: Option<ETag>,
        actual: Option<ETag>,
    },

    #[error("grain storage configuration error: {0}")]
    Configuration(String),

    /// Transient; the caller decides whether to retry.
    #[error("grain storage backend unavailable: {0}")]
    BackendUnavailable(StateError),

    #[error("invalid grain key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("grain state {key} could not be (de)serialized: {reason}")]
    Serialization { key: String, reason: String },

    #[error("grain storage error: {0}")]
    Storage(StateError),
}

impl GrainStorageError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, GrainStorageError::Conflict { .. })
    }
}

fn show(tag: &Option<ETag>) -> String {
    tag.as_ref()
        .map_or_else(|| "<none>".to_string(), ETag::to_string)
}

impl From<StateError> for GrainStorageError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict {
                key,
                expected,
                actual,
            } => GrainStorageError::Conflict {
                key,
                expected: expected.map(ETag::from),
                actual: actual.map(ETag::from),
            },
            StateError::NamespaceMissing(ns) => GrainStorageError::Configuration(format!(
                "grain state namespace {ns} does not exist and resource creation is disabled"
            )),
            e @ (StateError::Unavailable(_) | StateError::DeadlineExceeded { .. }) => {
                GrainStorageError::BackendUnavailable(e)
            }
            other => GrainStorageError::Storage(other),
        }
    }
}
