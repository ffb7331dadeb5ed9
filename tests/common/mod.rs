//! Common utilities for Khonsu UoW integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use khonsu_uow::prelude::*;
use parking_lot::Mutex;

// --- Journal ---

/// Whether an event marks the start or the end of a participant call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    End { ok: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub participant: String,
    pub phase: Phase,
    pub edge: Edge,
}

/// Shared, ordered log of participant calls across a whole transaction.
#[derive(Debug, Default)]
pub struct Journal {
    events: Mutex<Vec<Event>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, participant: &str, phase: Phase, edge: Edge) {
        self.events.lock().push(Event {
            participant: participant.to_string(),
            phase,
            edge,
        });
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Participants that received a call in `phase`, in call order.
    pub fn called(&self, phase: Phase) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.phase == phase && event.edge == Edge::Start)
            .map(|event| event.participant.clone())
            .collect()
    }

    /// Checks that no call of `later` started before every call of `earlier` ended.
    pub fn phase_barrier_holds(&self, earlier: Phase, later: Phase) -> bool {
        let events = self.events.lock();
        let last_end = events
            .iter()
            .rposition(|event| event.phase == earlier && matches!(event.edge, Edge::End { .. }));
        let first_start = events
            .iter()
            .position(|event| event.phase == later && event.edge == Edge::Start);
        match (last_end, first_start) {
            (Some(end), Some(start)) => end < start,
            _ => true,
        }
    }
}

// --- RecordingParticipant ---

/// Wraps a participant and logs every call into a [`Journal`].
pub struct RecordingParticipant {
    name: String,
    inner: Arc<dyn Participant>,
    journal: Arc<Journal>,
}

impl RecordingParticipant {
    pub fn new(name: &str, inner: Arc<dyn Participant>, journal: Arc<Journal>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            journal,
        }
    }

    async fn record(
        &self,
        phase: Phase,
        call: BoxFuture<'_, ParticipantResult>,
    ) -> ParticipantResult {
        self.journal.push(&self.name, phase, Edge::Start);
        let result = call.await;
        self.journal
            .push(&self.name, phase, Edge::End { ok: result.is_ok() });
        result
    }
}

impl Participant for RecordingParticipant {
    fn prepare<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.record(Phase::Prepare, self.inner.prepare(txn)).boxed()
    }

    fn commit<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.record(Phase::Commit, self.inner.commit(txn)).boxed()
    }

    fn rollback<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        self.record(Phase::Rollback, self.inner.rollback(txn)).boxed()
    }
}

// --- Helper Functions ---

/// Registers each mock under `p1`, `p2`, ... wrapped in a recorder.
pub fn enlist(
    uow: &DistributedUnitOfWork,
    mocks: &[Arc<MockParticipant>],
    journal: &Arc<Journal>,
) -> Vec<ParticipantId> {
    mocks
        .iter()
        .enumerate()
        .map(|(index, mock)| {
            let name = format!("p{}", index + 1);
            let recorder = RecordingParticipant::new(&name, mock.clone(), journal.clone());
            uow.register_participant(name, Arc::new(recorder)).unwrap()
        })
        .collect()
}

/// `count` mocks that succeed in every phase.
pub fn healthy_mocks(count: usize) -> Vec<Arc<MockParticipant>> {
    (0..count).map(|_| Arc::new(MockParticipant::new())).collect()
}
