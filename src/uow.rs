use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::UowConfig;
use crate::engine::PhaseEngine;
use crate::errors::{BoxError, Result, TransactionFailure, UowError};
use crate::participant::{Participant, ParticipantId};
use crate::state::{StatusSnapshot, TransactionStatus};
use crate::transaction_id::TransactionId;

/// Khonsu UoW prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::participant::*;
    pub use crate::participants::*;
    pub use crate::registry::*;
    pub use crate::state::*;
    pub use crate::transaction_id::*;
    pub use crate::uow::DistributedUnitOfWork;
}

/// Coordinator of one distributed transaction across independent participants.
///
/// A `DistributedUnitOfWork` is single-use: create it, register participants,
/// run it once, then read its final status. Cloning yields another handle to
/// the same transaction, which is how observers poll
/// [`get_transaction_status`](Self::get_transaction_status) while the
/// transaction is in flight.
///
/// Phases are executed on tokio tasks, so once a phase has started it runs to
/// completion even if the awaiting future is dropped.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use khonsu_uow::prelude::*;
///
/// # async fn demo() -> Result<()> {
/// let store = Arc::new(StoreParticipant::new());
/// let queue = Arc::new(QueueParticipant::new());
///
/// let uow = DistributedUnitOfWork::new();
/// uow.register_participant("orders-db", store.clone())?;
/// uow.register_participant("events", queue.clone())?;
///
/// let order_id = uow
///     .run(|txn| async move {
///         store.stage(&txn, "order:42", "pending")?;
///         queue.enqueue(&txn, "order 42 created")?;
///         Ok::<_, ParticipantError>(42)
///     })
///     .await?;
/// # let _ = order_id;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DistributedUnitOfWork {
    engine: Arc<PhaseEngine>,
}

impl Default for DistributedUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DistributedUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedUnitOfWork")
            .field("transaction_id", self.engine.transaction_id())
            .field("status", &self.engine.status())
            .finish()
    }
}

impl DistributedUnitOfWork {
    /// Creates a coordinator with the default [`UowConfig`].
    pub fn new() -> Self {
        Self::with_config(UowConfig::default())
    }

    /// Creates a coordinator with a fresh transaction id and the given configuration.
    pub fn with_config(config: UowConfig) -> Self {
        Self {
            engine: Arc::new(PhaseEngine::new(config)),
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        self.engine.transaction_id()
    }

    pub fn config(&self) -> &UowConfig {
        self.engine.config()
    }

    /// Enlists a participant under a unique, non-empty `name`.
    ///
    /// # Errors
    ///
    /// * [`UowError::EmptyParticipantName`] for an empty name.
    /// * [`UowError::DuplicateParticipant`] if the name is taken in this transaction.
    /// * [`UowError::InvalidState`] once PREPARE has started or the transaction ended.
    pub fn register_participant(
        &self,
        name: impl Into<String>,
        participant: Arc<dyn Participant>,
    ) -> Result<ParticipantId> {
        self.engine.register(name.into(), participant)
    }

    /// `(id, name)` of every registered participant, in registration order.
    pub fn participants(&self) -> Vec<(ParticipantId, String)> {
        self.engine.participants()
    }

    /// Id under which `name` was registered.
    pub fn participant_id(&self, name: &str) -> Option<ParticipantId> {
        self.engine.participant_id(name)
    }

    /// Number of registered participants. Still counts them after completion,
    /// when their handles have been released.
    pub fn participant_count(&self) -> usize {
        self.engine.participant_count()
    }

    /// Read-consistent snapshot of the transaction. Safe to call at any time.
    pub fn get_transaction_status(&self) -> StatusSnapshot {
        self.engine.snapshot()
    }

    /// Receives every status change of this transaction.
    pub fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.engine.subscribe()
    }

    /// Runs PREPARE on every participant.
    ///
    /// Returns `Prepared` when every participant voted yes. Otherwise the
    /// abort path has already run and the returned status is terminal
    /// (`RolledBack`, or `Failed` if a rollback failed).
    pub async fn begin(&self) -> Result<TransactionStatus> {
        drive(Arc::clone(&self.engine).prepare()).await
    }

    /// Runs COMMIT on every prepared participant. Requires status `Prepared`.
    ///
    /// Returns `Committed`, or `Failed` if any commit failed; the failures are
    /// in [`get_transaction_status`](Self::get_transaction_status).
    pub async fn commit(&self) -> Result<TransactionStatus> {
        drive(Arc::clone(&self.engine).commit()).await
    }

    /// Rolls back every prepared participant. Requires status `Prepared`.
    pub async fn rollback(&self) -> Result<TransactionStatus> {
        drive(Arc::clone(&self.engine).rollback()).await
    }

    /// Scoped acquisition of the transaction.
    ///
    /// PREPARE runs on entry. If every participant prepared, `body` runs with
    /// the transaction id; COMMIT follows when it returns `Ok`, ROLLBACK when
    /// it returns `Err` or panics. A panic is resumed after the rollback. If
    /// this future is dropped before completing, a cleanup task on the current
    /// tokio runtime waits for PREPARE to settle and rolls back a prepared
    /// transaction.
    ///
    /// # Errors
    ///
    /// Enlistment and state errors as for [`begin`](Self::begin). Any outcome
    /// other than `Committed` yields [`UowError::TransactionFailed`] carrying
    /// the final snapshot and, if the body failed, its error as the source.
    pub async fn run<F, Fut, T, E>(&self, body: F) -> Result<T>
    where
        F: FnOnce(TransactionId) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        // The guard is armed only once PREPARE is spawned, so a cleanup that
        // finds the transaction still `Pending` knows PREPARE is on its way.
        let prepare = tokio::spawn(Arc::clone(&self.engine).prepare());
        let mut guard = CompletionGuard::arm(Arc::clone(&self.engine));

        let status = match join_phase(prepare).await {
            Ok(status) => status,
            Err(err) => {
                guard.disarm();
                return Err(err);
            }
        };
        if status != TransactionStatus::Prepared {
            guard.disarm();
            return Err(self.failure(None));
        }

        let outcome = AssertUnwindSafe(body(self.transaction_id().clone()))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => match self.commit().await? {
                TransactionStatus::Committed => Ok(value),
                _ => Err(self.failure(None)),
            },
            Ok(Err(err)) => {
                let cause: BoxError = err.into();
                debug!(
                    "Transaction {}: body failed, rolling back: {}",
                    self.transaction_id(),
                    cause
                );
                if let Err(err) = self.rollback().await {
                    warn!(
                        "Transaction {}: rollback after body failure rejected: {}",
                        self.transaction_id(),
                        err
                    );
                }
                Err(self.failure(Some(cause)))
            }
            Err(panic) => {
                warn!(
                    "Transaction {}: body panicked, rolling back",
                    self.transaction_id()
                );
                if let Err(err) = self.rollback().await {
                    warn!(
                        "Transaction {}: rollback after panic failed: {}",
                        self.transaction_id(),
                        err
                    );
                }
                guard.disarm();
                std::panic::resume_unwind(panic);
            }
        };
        guard.disarm();
        result
    }

    /// Runs the whole protocol with no scoped work: PREPARE, then COMMIT.
    ///
    /// Returns the final snapshot when the transaction committed.
    pub async fn execute(&self) -> Result<StatusSnapshot> {
        self.run(|_| async { Ok::<_, BoxError>(()) }).await?;
        Ok(self.get_transaction_status())
    }

    fn failure(&self, cause: Option<BoxError>) -> UowError {
        UowError::TransactionFailed(Box::new(TransactionFailure {
            snapshot: self.get_transaction_status(),
            cause,
        }))
    }
}

/// Runs a phase on its own task and awaits it.
async fn drive<F>(phase: F) -> Result<TransactionStatus>
where
    F: Future<Output = Result<TransactionStatus>> + Send + 'static,
{
    join_phase(tokio::spawn(phase)).await
}

async fn join_phase(handle: JoinHandle<Result<TransactionStatus>>) -> Result<TransactionStatus> {
    handle
        .await
        .map_err(|err| UowError::Internal(format!("phase task did not complete: {err}")))?
}

/// Rolls back a transaction whose scope was dropped before completing.
struct CompletionGuard {
    engine: Option<Arc<PhaseEngine>>,
}

impl CompletionGuard {
    fn arm(engine: Arc<PhaseEngine>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    fn disarm(&mut self) {
        self.engine = None;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(engine.abandon());
            }
            Err(_) => warn!(
                "Transaction {}: scope dropped outside a tokio runtime, cannot roll back",
                engine.transaction_id()
            ),
        }
    }
}
