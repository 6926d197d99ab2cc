use thiserror::Error;

use crate::{state_machine::TransitionError, stores::StoreError};

pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures the coordinator and lifecycle surface to callers.
///
/// A lost claim race is deliberately absent: it is an outcome, see `ClaimOutcome`.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Another writer changed the row between read and write.
    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// Rejected by the store for reasons other than a precondition. Safe to retry.
    #[error("persistence failure: {0:#}")]
    PersistenceFailure(anyhow::Error),

    /// The realtime channel is unhealthy. Never user-facing on its own.
    #[error("realtime channel degraded")]
    ChannelDegraded,
}

impl From<StoreError> for DeliveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => DeliveryError::NotFound(what),
            StoreError::PreconditionFailed(message) => DeliveryError::PreconditionFailed(message),
            StoreError::Backend(err) => DeliveryError::PersistenceFailure(err),
        }
    }
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::PersistenceFailure(_))
    }
}
