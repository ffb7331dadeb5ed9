use std::collections::VecDeque;
use std::fmt;

use ahash::AHashMap as HashMap;

use crate::errors::ParticipantError;
use crate::transaction_id::TransactionId;

/// Where a participant stands for a given transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Prepared,
    Committed,
    RolledBack,
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerState::Prepared => f.write_str("prepared"),
            LedgerState::Committed => f.write_str("committed"),
            LedgerState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Per-transaction bookkeeping giving participants idempotent phase calls
/// and the not-prepared guard on commit and rollback.
///
/// Not synchronized; participants keep it under the same lock as the data it
/// protects so the ledger and the data never disagree.
///
/// Prepared entries are kept until they are committed or rolled back. Only the
/// most recent `retention` finished entries are remembered; once an entry is
/// evicted a repeated commit or rollback for it reports `NotPrepared` instead
/// of succeeding as a no-op.
#[derive(Debug)]
pub struct PreparedLedger {
    entries: HashMap<TransactionId, LedgerState>,
    finished: VecDeque<TransactionId>,
    retention: usize,
}

/// Finished entries remembered by a ledger built with [`PreparedLedger::new`].
pub const DEFAULT_LEDGER_RETENTION: usize = 1024;

impl Default for PreparedLedger {
    fn default() -> Self {
        Self::with_retention(DEFAULT_LEDGER_RETENTION)
    }
}

impl PreparedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: HashMap::new(),
            finished: VecDeque::new(),
            retention,
        }
    }

    /// Number of transactions currently tracked, prepared or finished.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, txn: &TransactionId) -> Option<LedgerState> {
        self.entries.get(txn).copied()
    }

    /// `Ok(true)` if the participant still has to prepare, `Ok(false)` for a
    /// repeated prepare.
    pub fn can_prepare(&self, txn: &TransactionId) -> Result<bool, ParticipantError> {
        match self.state(txn) {
            None => Ok(true),
            Some(LedgerState::Prepared) => Ok(false),
            Some(done) => Err(ParticipantError::Rejected(format!(
                "transaction {txn} already {done}"
            ))),
        }
    }

    pub fn mark_prepared(&mut self, txn: &TransactionId) {
        self.entries.insert(txn.clone(), LedgerState::Prepared);
    }

    /// `Ok(true)` if the commit must be applied now, `Ok(false)` if it already was.
    pub fn commit(&mut self, txn: &TransactionId) -> Result<bool, ParticipantError> {
        self.finish(txn, LedgerState::Committed)
    }

    /// `Ok(true)` if the rollback must be applied now, `Ok(false)` if it already was.
    pub fn rollback(&mut self, txn: &TransactionId) -> Result<bool, ParticipantError> {
        self.finish(txn, LedgerState::RolledBack)
    }

    fn finish(&mut self, txn: &TransactionId, target: LedgerState) -> Result<bool, ParticipantError> {
        match self.state(txn) {
            None => Err(ParticipantError::NotPrepared(txn.clone())),
            Some(LedgerState::Prepared) => {
                self.entries.insert(txn.clone(), target);
                self.retire(txn);
                Ok(true)
            }
            Some(current) if current == target => Ok(false),
            Some(current) => Err(ParticipantError::Rejected(format!(
                "transaction {txn} already {current}"
            ))),
        }
    }

    fn retire(&mut self, txn: &TransactionId) {
        self.finished.push_back(txn.clone());
        while self.finished.len() > self.retention {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}
