use crate::store::StoreError;
use drawsettle_types::{FailureKind, RoundId, RoundStatus, ValidationError};
use std::time::Duration;
use thiserror::Error;

/// Error returned by an external collaborator (ticket source, randomness
/// service, ledger).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Transient errors are retried with backoff; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout(_) | ServiceError::Unavailable(_) | ServiceError::RateLimited
        )
    }

    /// The request may have been applied even though no success came back.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout(_) | ServiceError::Unavailable(_) | ServiceError::Malformed(_)
        )
    }
}

/// Error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("round {0} not found")]
    RoundNotFound(RoundId),
    #[error("invalid round config: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("round {round_id}: {action} not allowed while {status}")]
    InvalidTransition {
        round_id: RoundId,
        status: RoundStatus,
        action: &'static str,
    },
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),
    #[error("randomness for round {round_id} failed verification: {reason}")]
    RandomnessUnverifiable { round_id: RoundId, reason: String },
    #[error("{operation} failed after {attempts} attempts: {source}")]
    External {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: ServiceError,
    },
    #[error("arithmetic invariant violated: {0}")]
    ArithmeticInvariant(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Classification for errors that stop a round.
    ///
    /// `None` means the error leaves the round status untouched (operator
    /// mistakes, lease contention, persistence failures) and re-driving the
    /// round later is safe.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            EngineError::DataIntegrity(_) => Some(FailureKind::DataIntegrity),
            EngineError::RandomnessUnverifiable { .. } => {
                Some(FailureKind::RandomnessUnverifiable)
            }
            EngineError::External { source, .. } if source.is_transient() => {
                Some(FailureKind::TransientExhausted)
            }
            EngineError::External { .. } => Some(FailureKind::ServiceRejected),
            EngineError::ArithmeticInvariant(_) => Some(FailureKind::ArithmeticInvariant),
            EngineError::RoundNotFound(_)
            | EngineError::InvalidConfig(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::Store(_) => None,
        }
    }
}
