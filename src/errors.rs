use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{StatusSnapshot, TransactionStatus};
use crate::transaction_id::TransactionId;

/// Boxed error returned by the body of a unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the coordinator to its caller.
#[derive(Error, Debug)]
pub enum UowError {
    #[error("participant name must not be empty")]
    EmptyParticipantName,

    #[error("participant `{0}` is already registered in this transaction")]
    DuplicateParticipant(String),

    #[error("cannot {operation}: transaction is {status}")]
    InvalidState {
        operation: &'static str,
        status: TransactionStatus,
    },

    #[error(transparent)]
    TransactionFailed(Box<TransactionFailure>),

    #[error("internal coordinator error: {0}")]
    Internal(String),
}

impl UowError {
    /// Returns the aggregate failure if this error carries one.
    pub fn failure(&self) -> Option<&TransactionFailure> {
        match self {
            UowError::TransactionFailed(failure) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn invalid_state(operation: &'static str, status: TransactionStatus) -> Self {
        UowError::InvalidState { operation, status }
    }
}

/// Aggregate error raised when a unit of work does not end `COMMITTED`.
///
/// The snapshot holds the terminal status together with every recorded
/// participant failure, in the order they were observed.
#[derive(Error, Debug)]
#[error(
    "transaction {} ended {} with {} participant failure(s)",
    .snapshot.transaction_id,
    .snapshot.status,
    .snapshot.failed_count
)]
pub struct TransactionFailure {
    /// Final status of the transaction.
    pub snapshot: StatusSnapshot,
    /// Error returned by the unit-of-work body, if the body is what aborted it.
    #[source]
    pub cause: Option<BoxError>,
}

/// Failure reported by (or on behalf of) a single participant call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantError {
    /// Commit or rollback arrived without a successful prepare for the transaction.
    #[error("transaction {0} was not prepared by this participant")]
    NotPrepared(TransactionId),

    #[error("participant rejected the request: {0}")]
    Rejected(String),

    #[error("participant call timed out after {0:?}")]
    Timeout(Duration),

    #[error("participant panicked: {0}")]
    Panicked(String),

    #[error("other participant error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, UowError>;
