use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::errors::ParticipantError;
use crate::participant::{Participant, ParticipantResult};
use crate::participants::ledger::{LedgerState, PreparedLedger};
use crate::state::Phase;
use crate::transaction_id::TransactionId;

/// Scripted reaction of a [`MockParticipant`] to one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// Return `ParticipantError::Rejected` with the given reason.
    Fail(String),
    /// Panic with the given message instead of returning.
    Panic(String),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Never complete.
    Hang,
}

/// Participant with scripted per-phase outcomes and call counters.
///
/// Successful calls go through a [`PreparedLedger`], so a commit or rollback
/// without a prior successful prepare fails with `NotPrepared`, and repeated
/// calls are idempotent.
#[derive(Debug)]
pub struct MockParticipant {
    prepare: Behavior,
    commit: Behavior,
    rollback: Behavior,
    prepare_calls: AtomicUsize,
    commit_calls: AtomicUsize,
    rollback_calls: AtomicUsize,
    ledger: Mutex<PreparedLedger>,
}

impl Default for MockParticipant {
    fn default() -> Self {
        Self::new()
    }
}

impl MockParticipant {
    /// A participant that succeeds in every phase.
    pub fn new() -> Self {
        Self {
            prepare: Behavior::Succeed,
            commit: Behavior::Succeed,
            rollback: Behavior::Succeed,
            prepare_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            rollback_calls: AtomicUsize::new(0),
            ledger: Mutex::new(PreparedLedger::new()),
        }
    }

    pub fn with_behavior(mut self, phase: Phase, behavior: Behavior) -> Self {
        match phase {
            Phase::Prepare => self.prepare = behavior,
            Phase::Commit => self.commit = behavior,
            Phase::Rollback => self.rollback = behavior,
        }
        self
    }

    pub fn failing_prepare(reason: impl Into<String>) -> Self {
        Self::new().with_behavior(Phase::Prepare, Behavior::Fail(reason.into()))
    }

    pub fn failing_commit(reason: impl Into<String>) -> Self {
        Self::new().with_behavior(Phase::Commit, Behavior::Fail(reason.into()))
    }

    pub fn failing_rollback(reason: impl Into<String>) -> Self {
        Self::new().with_behavior(Phase::Rollback, Behavior::Fail(reason.into()))
    }

    pub fn panicking_prepare(message: impl Into<String>) -> Self {
        Self::new().with_behavior(Phase::Prepare, Behavior::Panic(message.into()))
    }

    pub fn calls(&self, phase: Phase) -> usize {
        self.counter(phase).load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> usize {
        self.calls(Phase::Prepare)
    }

    pub fn commit_calls(&self) -> usize {
        self.calls(Phase::Commit)
    }

    pub fn rollback_calls(&self) -> usize {
        self.calls(Phase::Rollback)
    }

    /// Whether this participant currently holds `txn` prepared and unresolved.
    pub fn is_prepared(&self, txn: &TransactionId) -> bool {
        self.ledger.lock().state(txn) == Some(LedgerState::Prepared)
    }

    fn counter(&self, phase: Phase) -> &AtomicUsize {
        match phase {
            Phase::Prepare => &self.prepare_calls,
            Phase::Commit => &self.commit_calls,
            Phase::Rollback => &self.rollback_calls,
        }
    }

    fn behavior(&self, phase: Phase) -> &Behavior {
        match phase {
            Phase::Prepare => &self.prepare,
            Phase::Commit => &self.commit,
            Phase::Rollback => &self.rollback,
        }
    }

    async fn respond(&self, phase: Phase, txn: &TransactionId) -> ParticipantResult {
        self.counter(phase).fetch_add(1, Ordering::SeqCst);
        match self.behavior(phase) {
            Behavior::Succeed => {}
            Behavior::Fail(reason) => return Err(ParticipantError::Rejected(reason.clone())),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Delay(duration) => tokio::time::sleep(*duration).await,
            Behavior::Hang => futures::future::pending::<()>().await,
        }

        let mut ledger = self.ledger.lock();
        match phase {
            Phase::Prepare => {
                ledger.can_prepare(txn)?;
                ledger.mark_prepared(txn);
                Ok(())
            }
            Phase::Commit => ledger.commit(txn).map(drop),
            Phase::Rollback => ledger.rollback(txn).map(drop),
        }
    }
}

impl Participant for MockParticipant {
    fn prepare<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.respond(Phase::Prepare, txn).boxed()
    }

    fn commit<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.respond(Phase::Commit, txn).boxed()
    }

    fn rollback<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.respond(Phase::Rollback, txn).boxed()
    }
}
