use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::errors::ParticipantError;
use crate::transaction_id::TransactionId;

/// Outcome of a single participant call.
pub type ParticipantResult = std::result::Result<(), ParticipantError>;

/// Coordinator-assigned identity of a registered participant.
///
/// Ids are dense and follow registration order within one transaction, so
/// sorting by id reproduces the order participants were enlisted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(usize);

impl ParticipantId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the participant in registration order.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Trait for a participant in a two-phase commit protocol.
///
/// A participant is an independent resource (a database, a message broker,
/// a cache invalidator, ...) enlisted in one distributed transaction. The
/// coordinator only ever talks to participants through this trait and treats
/// every outcome as a black-box success or failure.
///
/// Every method is keyed by the coordinator's [`TransactionId`] and must be
/// idempotent for that id: a repeated `commit` or `rollback` after a first
/// success must not corrupt participant state. `commit` and `rollback` must
/// fail with [`ParticipantError::NotPrepared`] when no prior `prepare`
/// succeeded for the id.
///
/// Implementations must be `Send` and `Sync`; the coordinator issues the calls
/// of one phase concurrently.
///
/// # Examples
///
/// ```no_run
/// use khonsu_uow::prelude::*;
/// use futures::future::{BoxFuture, FutureExt};
///
/// struct CacheInvalidator;
///
/// impl Participant for CacheInvalidator {
///     fn prepare<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
///         async move {
///             println!("cache: prepared {txn}");
///             Ok(())
///         }
///         .boxed()
///     }
///
///     fn commit<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
///         async move {
///             println!("cache: invalidated for {txn}");
///             Ok(())
///         }
///         .boxed()
///     }
///
///     fn rollback<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult> {
///         async move { Ok(()) }.boxed()
///     }
/// }
/// ```
pub trait Participant: Send + Sync {
    /// Phase 1: vote on the transaction.
    ///
    /// The participant validates its staged work and reserves whatever it needs
    /// to guarantee a later `commit` succeeds. Returning `Ok(())` is a yes vote.
    fn prepare<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult>;

    /// Phase 2: make the prepared work durable and visible.
    fn commit<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult>;

    /// Phase 2 (abort path): discard the prepared work.
    fn rollback<'a>(&'a self, txn: &'a TransactionId) -> BoxFuture<'a, ParticipantResult>;
}
