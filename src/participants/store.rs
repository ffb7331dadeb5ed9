use ahash::AHashMap as HashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::debug;
use parking_lot::Mutex;

use crate::errors::ParticipantError;
use crate::participant::{Participant, ParticipantResult};
use crate::participants::ledger::PreparedLedger;
use crate::transaction_id::TransactionId;

/// A staged write: `Some(value)` for insert/update, `None` for delete.
type StagedWrite = (String, Option<String>);

/// In-memory key/value store taking part in distributed transactions.
///
/// Writes are staged per transaction and stay invisible until commit.
/// Preparing locks every staged key for the transaction; a key locked by
/// another prepared transaction makes the prepare fail and discards the
/// transaction's staged writes.
#[derive(Debug, Default)]
pub struct StoreParticipant {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    data: HashMap<String, String>,
    staged: HashMap<TransactionId, Vec<StagedWrite>>,
    locks: HashMap<String, TransactionId>,
    ledger: PreparedLedger,
}

impl StoreParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `key = value` for `txn`.
    pub fn stage(
        &self,
        txn: &TransactionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ParticipantError> {
        self.stage_write(txn, key.into(), Some(value.into()))
    }

    /// Stages the deletion of `key` for `txn`.
    pub fn stage_delete(
        &self,
        txn: &TransactionId,
        key: impl Into<String>,
    ) -> Result<(), ParticipantError> {
        self.stage_write(txn, key.into(), None)
    }

    fn stage_write(
        &self,
        txn: &TransactionId,
        key: String,
        value: Option<String>,
    ) -> Result<(), ParticipantError> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.ledger.state(txn) {
            return Err(ParticipantError::Rejected(format!(
                "transaction {txn} is already {state}, writes are frozen"
            )));
        }
        inner.staged.entry(txn.clone()).or_default().push((key, value));
        Ok(())
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes staged by `txn` and not yet committed or discarded.
    pub fn staged(&self, txn: &TransactionId) -> usize {
        self.inner.lock().staged.get(txn).map_or(0, Vec::len)
    }

    /// Transaction currently holding the lock on `key`, if any.
    pub fn lock_holder(&self, key: &str) -> Option<TransactionId> {
        self.inner.lock().locks.get(key).cloned()
    }

    fn prepare_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        if !inner.ledger.can_prepare(txn)? {
            return Ok(());
        }
        let keys: Vec<String> = inner
            .staged
            .get(txn)
            .map(|writes| writes.iter().map(|(key, _)| key.clone()).collect())
            .unwrap_or_default();
        if let Some((key, holder)) = keys.iter().find_map(|key| {
            inner
                .locks
                .get(key)
                .filter(|holder| *holder != txn)
                .map(|holder| (key, holder))
        }) {
            let reason = format!("key `{key}` is locked by transaction {holder}");
            inner.staged.remove(txn);
            debug!("Store: dropped staged writes of {}: {}", txn, reason);
            return Err(ParticipantError::Rejected(reason));
        }
        for key in keys {
            inner.locks.insert(key, txn.clone());
        }
        inner.ledger.mark_prepared(txn);
        debug!("Store: prepared transaction {}", txn);
        Ok(())
    }

    fn commit_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        if !inner.ledger.commit(txn)? {
            return Ok(());
        }
        let writes = inner.staged.remove(txn).unwrap_or_default();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    inner.data.insert(key.clone(), value);
                }
                None => {
                    inner.data.remove(&key);
                }
            }
            inner.locks.remove(&key);
        }
        debug!("Store: committed transaction {}", txn);
        Ok(())
    }

    fn rollback_now(&self, txn: &TransactionId) -> ParticipantResult {
        let mut inner = self.inner.lock();
        // Unprepared writes hold no locks; drop them and still report the error.
        let applies = inner.ledger.rollback(txn).inspect_err(|_| {
            inner.staged.remove(txn);
        })?;
        if !applies {
            return Ok(());
        }
        let writes = inner.staged.remove(txn).unwrap_or_default();
        for (key, _) in writes {
            if inner.locks.get(&key) == Some(txn) {
                inner.locks.remove(&key);
            }
        }
        debug!("Store: rolled back transaction {}", txn);
        Ok(())
    }
}

impl Participant for StoreParticipant {
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
