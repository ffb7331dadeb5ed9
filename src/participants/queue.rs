use std::collections::VecDeque;

use ahash::AHashMap as HashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::debug;
use parking_lot::Mutex;

use crate::errors::ParticipantError;
use crate::participant::{Participant, ParticipantResult};
use crate::participants::ledger::PreparedLedger;
use crate::transaction_id::TransactionId;

/// Message queue whose messages are published only when their transaction commits.
///
/// An optional capacity bounds published plus reserved messages; prepare
/// reserves room for the transaction's messages and fails, discarding them,
/// when the queue cannot take them.
#[derive(Debug, Default)]
pub struct QueueParticipant {
    capacity: Option<usize>,
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    published: VecDeque<String>,
    pending: HashMap<TransactionId, Vec<String>>,
    reserved: usize,
    ledger: PreparedLedger,
}

impl QueueParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            inner: Mutex::default(),
        }
    }

    /// Queues `message` for publication when `txn` commits.
    pub fn enqueue(
        &self,
        txn: &TransactionId,
        message: impl Into<String>,
    ) -> Result<(), ParticipantError> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.ledger.state(txn) {
            return Err(ParticipantError::Rejected(format!(
                "transaction {txn} is already {state}, cannot enqueue"
            )));
        }
        inner
            .pending
            .entry(txn.clone())
            .or_default()
            .push(message.into());
        Ok(())
    }

    /// Published messages, oldest first.
    pub fn published(&self) -> Vec<String> {
        self.inner.lock().published.iter().cloned().collect()
    }

    /// Removes and returns the oldest published message.
    pub fn pop(&self) -> Option<String> {
        self.inner.lock().published.pop_front()
    }

    /// Messages still waiting on `txn`.
    pub fn pending(&self, txn: &TransactionId) -> usize {
        self.inner.lock().pending.get(txn).map_or(0, Vec::len)
    }

    fn prepare_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        if !inner.ledger.can_prepare(txn)? {
            return Ok(());
        }
        let wanted = inner.pending.get(txn).map_or(0, Vec::len);
        if let Some(capacity) = self.capacity {
            let used = inner.published.len() + inner.reserved;
            if used + wanted > capacity {
                inner.pending.remove(txn);
                return Err(ParticipantError::Rejected(format!(
                    "queue full: {used} of {capacity} slots used, {wanted} requested"
                )));
            }
        }
        inner.reserved += wanted;
        inner.ledger.mark_prepared(txn);
        debug!("Queue: prepared {} message(s) for {}", wanted, txn);
        Ok(())
    }

    fn commit_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        if !inner.ledger.commit(txn)? {
            return Ok(());
        }
        let messages = inner.pending.remove(txn).unwrap_or_default();
        inner.reserved = inner.reserved.saturating_sub(messages.len());
        inner.published.extend(messages);
        debug!("Queue: published messages of {}", txn);
        Ok(())
    }

    fn rollback_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        // Unprepared messages hold no reservation; drop them and still report the error.
        let applies = inner.ledger.rollback(txn).inspect_err(|_| {
            inner.pending.remove(txn);
        })?;
        if !applies {
            return Ok(());
        }
        let messages = inner.pending.remove(txn).unwrap_or_default();
        inner.reserved = inner.reserved.saturating_sub(messages.len());
        debug!("Queue: discarded {} message(s) of {}", messages.len(), txn);
        Ok(())
    }
}

impl Participant for QueueParticipant {
    fn prepare<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        async move { self.prepare_now(txn) }.boxed()
    }

    fn commit<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        async move { self.commit_now(txn) }.boxed()
    }

    fn rollback<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
        async move { self.rollback_now(txn) }.boxed()
    }
}
