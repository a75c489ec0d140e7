//! Error types for the orchestration service

use diamondchain_notary::FinalityError;
use diamondchain_protocols::{ContractError, SigningError, ValidationError};
use diamondchain_types::{
    AttemptId, PartyName, RecordId, Rejection, RejectionKind, TxId, UnsupportedIntentError,
};
use std::time::Duration;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors that can occur during orchestration
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    UnsupportedIntent(#[from] UnsupportedIntentError),

    #[error("No current record found for {0}")]
    RecordNotFound(RecordId),

    #[error("External ID returned more than 1 result: {record_id} ({count} current records)")]
    AmbiguousRecord { record_id: RecordId, count: usize },

    #[error("Counterparty {party} rejected the transaction: {reason}")]
    CounterpartyRejection { party: PartyName, reason: String },

    #[error("Finality conflict: {claim} already consumed by transaction {conflicting_tx}")]
    FinalityConflict { claim: String, conflicting_tx: TxId },

    #[error("Counterparty {party} did not respond within {after:?}")]
    CounterpartyTimeout { party: PartyName, after: Duration },

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Finality error: {0}")]
    Finality(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown party: {0}")]
    UnknownParty(PartyName),

    #[error("Attempt {0} not found")]
    AttemptNotFound(AttemptId),

    #[error("Attempt {0} in invalid state for operation: {1}")]
    InvalidState(String, String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown signal received")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// Structured form recorded on a rejected attempt.
    pub fn rejection(&self) -> Rejection {
        let kind = match self {
            OrchestrationError::Validation(_) => RejectionKind::Validation,
            OrchestrationError::UnsupportedIntent(_) => RejectionKind::UnsupportedIntent,
            OrchestrationError::RecordNotFound(_) => RejectionKind::RecordNotFound,
            OrchestrationError::AmbiguousRecord { .. } => RejectionKind::AmbiguousRecord,
            OrchestrationError::CounterpartyRejection { .. } => {
                RejectionKind::CounterpartyRejection
            }
            OrchestrationError::FinalityConflict { .. } => RejectionKind::FinalityConflict,
            OrchestrationError::CounterpartyTimeout { .. } => RejectionKind::CounterpartyTimeout,
            _ => RejectionKind::Internal,
        };
        Rejection {
            kind,
            reason: self.to_string(),
        }
    }

    /// Whether an attempt that already reached finality submission should
    /// stay resumable instead of being rejected.
    ///
    /// A finality call that failed without an answer may still have been
    /// accepted, so the attempt keeps its signed proposal for resubmission.
    pub fn leaves_attempt_open(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Finality(_)
                | OrchestrationError::Storage(_)
                | OrchestrationError::NetworkError(_)
                | OrchestrationError::Shutdown
        )
    }
}

impl From<ContractError> for OrchestrationError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::UnsupportedIntent(e) => OrchestrationError::UnsupportedIntent(e),
            ContractError::Validation(e) => OrchestrationError::Validation(e),
        }
    }
}

impl From<FinalityError> for OrchestrationError {
    fn from(err: FinalityError) -> Self {
        match err {
            FinalityError::Conflict {
                claim,
                conflicting_tx,
            } => OrchestrationError::FinalityConflict {
                claim,
                conflicting_tx,
            },
            FinalityError::Unavailable { reason } => OrchestrationError::Finality(reason),
            refused => {
                OrchestrationError::Internal(format!("Notary refused transaction: {}", refused))
            }
        }
    }
}

impl From<diamondchain_types::Error> for OrchestrationError {
    fn from(err: diamondchain_types::Error) -> Self {
        OrchestrationError::Storage(err.into())
    }
}

impl From<tokio::task::JoinError> for OrchestrationError {
    fn from(err: tokio::task::JoinError) -> Self {
        OrchestrationError::Internal(format!("Task join error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diamondchain_protocols::Violation;
    use diamondchain_types::Intent;

    #[test]
    fn test_validation_reason_is_preserved() {
        let err: OrchestrationError = ValidationError {
            intent: Intent::Transfer,
            violation: Violation::SameOwner,
        }
        .into();
        assert_eq!(err.to_string(), "new owner must differ from previous owner");

        let rejection = err.rejection();
        assert_eq!(rejection.kind, RejectionKind::Validation);
        assert_eq!(rejection.reason, "new owner must differ from previous owner");
    }

    #[test]
    fn test_finality_mapping() {
        let err: OrchestrationError = FinalityError::Conflict {
            claim: "state/a/b".to_string(),
            conflicting_tx: TxId::from("t2"),
        }
        .into();
        assert!(matches!(err, OrchestrationError::FinalityConflict { .. }));
        assert!(!err.leaves_attempt_open());

        let err: OrchestrationError = FinalityError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(err.leaves_attempt_open());

        let err: OrchestrationError = FinalityError::UnknownState {
            state: "output/a/never-existed".to_string(),
        }
        .into();
        assert!(!err.leaves_attempt_open());
        assert!(err.to_string().contains("not an output of an accepted transaction"));
    }

    #[test]
    fn test_timeout_rejection_kind() {
        let err = OrchestrationError::CounterpartyTimeout {
            party: PartyName::from("P3"),
            after: Duration::from_secs(60),
        };
        assert_eq!(err.rejection().kind, RejectionKind::CounterpartyTimeout);
        assert!(err.to_string().contains("P3"));
    }
}
