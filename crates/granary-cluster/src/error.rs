//! Error types for cluster membership.

use thiserror::Error;

use granary_core::{ConfigError, SiloId};
use granary_state::StateError;

use crate::directory::JoinRejection;

pub type MembershipResult<T> = Result<T, MembershipError>;

#[derive(Debug, Error)]
pub enum MembershipError {
    /// Fatal: bad configuration or a namespace that cannot be used.
    #[error("membership configuration error: {0}")]
    Configuration(String),

    #[error("join rejected: {0}")]
    IdentityConflict(JoinRejection),

    /// The silo's lease lapsed; it must rejoin as a new generation.
    #[error("lease expired for {0}")]
    LeaseExpired(SiloId),

    /// No record for this silo incarnation; it must rejoin.
    #[error("unknown silo {0}")]
    UnknownSilo(SiloId),

    /// Lost a compare-and-swap race too many times in a row.
    #[error("concurrent update of {0}")]
    Conflict(String),

    /// Transient; the caller decides whether to retry.
    #[error("membership backend unavailable: {0}")]
    BackendUnavailable(StateError),

    #[error("membership storage error: {0}")]
    Storage(StateError),

    #[error("corrupt membership record {key}: {reason}")]
    Serialization { key: String, reason: String },
}

impl MembershipError {
    /// Errors a silo cannot recover from by waiting and retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MembershipError::Configuration(_) | MembershipError::IdentityConflict(_)
        )
    }
}

impl From<StateError> for MembershipError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict { key, .. } => MembershipError::Conflict(key),
            StateError::NamespaceMissing(ns) => MembershipError::Configuration(format!(
                "membership namespace {ns} does not exist and resource creation is disabled"
            )),
            e @ (StateError::Unavailable(_) | StateError::DeadlineExceeded { .. }) => {
                MembershipError::BackendUnavailable(e)
            }
            other => MembershipError::Storage(other),
        }
    }
}

impl From<ConfigError> for MembershipError {
    fn from(e: ConfigError) -> Self {
        MembershipError::Configuration(e.to_string())
    }
}
