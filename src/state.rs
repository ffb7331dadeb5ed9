use std::fmt;

use ahash::AHashSet as HashSet;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::{ParticipantError, UowError};
use crate::participant::ParticipantId;
use crate::transaction_id::TransactionId;

/// Lifecycle status of one distributed transaction.
///
/// Happy path: `Pending -> Preparing -> Prepared -> Committing -> Committed`.
/// Abort path: `Preparing | Prepared -> Aborting -> RolledBack`.
/// `Failed` is reached when a commit or a rollback could not be completed
/// by every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    /// `Committed`, `RolledBack` and `Failed` end the transaction for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Failed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Preparing)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Prepared, Aborting)
                | (Committing, Committed)
                | (Committing, Failed)
                | (Aborting, RolledBack)
                | (Aborting, Failed)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Preparing => "PREPARING",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::Aborting => "ABORTING",
            TransactionStatus::RolledBack => "ROLLED_BACK",
            TransactionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Protocol phase a participant call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prepare => f.write_str("prepare"),
            Phase::Commit => f.write_str("commit"),
            Phase::Rollback => f.write_str("rollback"),
        }
    }
}

/// One failed participant call. Failures are never discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    pub phase: Phase,
    pub error: ParticipantError,
}

/// Point-in-time, read-consistent view of a transaction.
///
/// Participant id lists are sorted, i.e. in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub prepared_count: usize,
    pub committed_count: usize,
    pub rolled_back_count: usize,
    pub failed_count: usize,
    pub prepared: Vec<ParticipantId>,
    pub committed: Vec<ParticipantId>,
    pub rolled_back: Vec<ParticipantId>,
    pub failures: Vec<FailureRecord>,
}

impl StatusSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Failures recorded during the given phase.
    pub fn failures_in(&self, phase: Phase) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(move |f| f.phase == phase)
    }
}

/// The single source of truth for one transaction's lifecycle.
///
/// Lives behind the coordinator's mutex and is only mutated by the phase
/// engine. Every status change is also published on a watch channel.
pub(crate) struct TransactionState {
    transaction_id: TransactionId,
    status: TransactionStatus,
    prepared: HashSet<ParticipantId>,
    committed: HashSet<ParticipantId>,
    rolled_back: HashSet<ParticipantId>,
    failures: Vec<FailureRecord>,
    status_tx: watch::Sender<TransactionStatus>,
}

impl TransactionState {
    pub(crate) fn new(transaction_id: TransactionId) -> Self {
        let (status_tx, _) = watch::channel(TransactionStatus::Pending);
        Self {
            transaction_id,
            status: TransactionStatus::Pending,
            prepared: HashSet::new(),
            committed: HashSet::new(),
            rolled_back: HashSet::new(),
            failures: Vec::new(),
            status_tx,
        }
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.status_tx.subscribe()
    }

    /// Moves to `next`, rejecting anything the state machine does not allow.
    pub(crate) fn transition(
        &mut self,
        operation: &'static str,
        next: TransactionStatus,
    ) -> Result<(), UowError> {
        if !self.status.can_transition_to(next) {
            return Err(UowError::invalid_state(operation, self.status));
        }
        debug!(
            "Transaction {}: {} -> {}",
            self.transaction_id, self.status, next
        );
        self.status = next;
        self.status_tx.send_replace(next);
        Ok(())
    }

    pub(crate) fn mark_prepared(&mut self, id: ParticipantId) {
        self.prepared.insert(id);
    }

    /// Only participants that prepared and are past the commit decision may commit.
    pub(crate) fn mark_committed(&mut self, id: ParticipantId) -> bool {
        if self.status != TransactionStatus::Committing
            || !self.prepared.contains(&id)
            || self.rolled_back.contains(&id)
        {
            return false;
        }
        self.committed.insert(id)
    }

    pub(crate) fn mark_rolled_back(&mut self, id: ParticipantId) -> bool {
        if !self.prepared.contains(&id) || self.committed.contains(&id) {
            return false;
        }
        self.rolled_back.insert(id)
    }

    pub(crate) fn record_failure(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }

    /// Prepared participants in registration order.
    pub(crate) fn prepared_ids(&self) -> Vec<ParticipantId> {
        sorted(&self.prepared)
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            transaction_id: self.transaction_id.clone(),
            status: self.status,
            prepared_count: self.prepared.len(),
            committed_count: self.committed.len(),
            rolled_back_count: self.rolled_back.len(),
            failed_count: self.failures.len(),
            prepared: sorted(&self.prepared),
            committed: sorted(&self.committed),
            rolled_back: sorted(&self.rolled_back),
            failures: self.failures.clone(),
        }
    }
}

fn sorted(set: &HashSet<ParticipantId>) -> Vec<ParticipantId> {
    let mut ids: Vec<_> = set.iter().copied().collect();
    ids.sort_unstable();
    ids
}
