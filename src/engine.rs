//! Phase engine: drives PREPARE, then COMMIT or ROLLBACK, across every
//! registered participant.
//!
//! Each phase fans out to its target participants concurrently and waits for
//! all of them before deciding the next status. The state lock is held only
//! while reading targets or recording results, never across a participant call.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, stream};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

use crate::config::UowConfig;
use crate::errors::{ParticipantError, Result, UowError};
use crate::participant::{Participant, ParticipantId, ParticipantResult};
use crate::registry::{ParticipantRegistry, Registration};
use crate::state::{FailureRecord, Phase, StatusSnapshot, TransactionState, TransactionStatus};
use crate::transaction_id::TransactionId;

/// Shared core of one coordinator instance.
pub(crate) struct PhaseEngine {
    transaction_id: TransactionId,
    config: UowConfig,
    // Lock order: `state` before `registry`.
    state: Mutex<TransactionState>,
    registry: RwLock<ParticipantRegistry>,
}

impl PhaseEngine {
    pub(crate) fn new(config: UowConfig) -> Self {
        let transaction_id = TransactionId::generate();
        Self {
            state: Mutex::new(TransactionState::new(transaction_id.clone())),
            registry: RwLock::new(ParticipantRegistry::new()),
            transaction_id,
            config,
        }
    }

    pub(crate) fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub(crate) fn config(&self) -> &UowConfig {
        &self.config
    }

    pub(crate) fn register(
        &self,
        name: String,
        participant: Arc<dyn Participant>,
    ) -> Result<ParticipantId> {
        let state = self.state.lock();
        let mut registry = self.registry.write();
        if state.status() != TransactionStatus::Pending || registry.is_sealed() {
            return Err(UowError::invalid_state("register participant", state.status()));
        }
        let id = registry.register(name, participant)?;
        debug!(
            "Transaction {}: registered participant {} as {}",
            self.transaction_id,
            registry.name_of(id).unwrap_or_default(),
            id
        );
        Ok(id)
    }

    pub(crate) fn participants(&self) -> Vec<(ParticipantId, String)> {
        self.registry.read().names()
    }

    pub(crate) fn participant_id(&self, name: &str) -> Option<ParticipantId> {
        self.registry.read().id_of(name)
    }

    pub(crate) fn participant_count(&self) -> usize {
        self.registry.read().len()
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        self.state.lock().snapshot()
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.state.lock().status()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.state.lock().subscribe()
    }

    /// PREPARE phase. Ends `Prepared`, or runs the abort path to completion.
    pub(crate) async fn prepare(self: Arc<Self>) -> Result<TransactionStatus> {
        let targets = {
            let mut state = self.state.lock();
            state.transition("begin", TransactionStatus::Preparing)?;
            let mut registry = self.registry.write();
            registry.seal();
            if registry.is_empty() {
                debug!(
                    "Transaction {}: no participants enlisted",
                    self.transaction_id
                );
            }
            registry.list().to_vec()
        };
        let deadline = self
            .config
            .transaction_timeout
            .map(|limit| Instant::now() + limit);
        debug!(
            "Transaction {}: preparing {} participant(s)",
            self.transaction_id,
            targets.len()
        );

        let results = self.fan_out(Phase::Prepare, targets, deadline).await;

        let all_prepared = {
            let mut state = self.state.lock();
            let mut all_prepared = true;
            for (registration, outcome) in results {
                match outcome {
                    Ok(()) => state.mark_prepared(registration.id),
                    Err(err) => {
                        all_prepared = false;
                        warn!(
                            "Transaction {}: participant {} failed to prepare: {}",
                            self.transaction_id, registration.name, err
                        );
                        state.record_failure(failure(&registration, Phase::Prepare, err));
                    }
                }
            }
            if all_prepared {
                state.transition("prepare", TransactionStatus::Prepared)?;
            } else {
                state.transition("abort", TransactionStatus::Aborting)?;
            }
            all_prepared
        };

        if all_prepared {
            Ok(TransactionStatus::Prepared)
        } else {
            self.rollback_prepared().await
        }
    }

    /// COMMIT phase, only valid once every participant prepared.
    pub(crate) async fn commit(self: Arc<Self>) -> Result<TransactionStatus> {
        let targets = {
            let mut state = self.state.lock();
            if state.status() != TransactionStatus::Prepared {
                return Err(UowError::invalid_state("commit", state.status()));
            }
            state.transition("commit", TransactionStatus::Committing)?;
            self.registrations_for(&state.prepared_ids())
        };

        let results = self.fan_out(Phase::Commit, targets, None).await;

        let status = {
            let mut state = self.state.lock();
            let mut failed = false;
            for (registration, outcome) in results {
                match outcome {
                    Ok(()) => {
                        state.mark_committed(registration.id);
                    }
                    Err(err) => {
                        failed = true;
                        error!(
                            "Transaction {}: participant {} failed to commit after a successful prepare: {}",
                            self.transaction_id, registration.name, err
                        );
                        state.record_failure(failure(&registration, Phase::Commit, err));
                    }
                }
            }
            let next = if failed {
                TransactionStatus::Failed
            } else {
                TransactionStatus::Committed
            };
            state.transition("finish commit", next)?;
            next
        };
        self.finish(status);
        Ok(status)
    }

    /// Explicit abort of a prepared transaction.
    pub(crate) async fn rollback(self: Arc<Self>) -> Result<TransactionStatus> {
        {
            let mut state = self.state.lock();
            if state.status() != TransactionStatus::Prepared {
                return Err(UowError::invalid_state("rollback", state.status()));
            }
            state.transition("rollback", TransactionStatus::Aborting)?;
        }
        self.rollback_prepared().await
    }

    /// ROLLBACK phase: only participants that prepared are asked to roll back.
    async fn rollback_prepared(&self) -> Result<TransactionStatus> {
        let targets = {
            let state = self.state.lock();
            self.registrations_for(&state.prepared_ids())
        };
        debug!(
            "Transaction {}: rolling back {} prepared participant(s)",
            self.transaction_id,
            targets.len()
        );

        let results = self.fan_out(Phase::Rollback, targets, None).await;

        let status = {
            let mut state = self.state.lock();
            let mut failed = false;
            for (registration, outcome) in results {
                match outcome {
                    Ok(()) => {
                        state.mark_rolled_back(registration.id);
                    }
                    Err(err) => {
                        failed = true;
                        error!(
                            "Transaction {}: participant {} failed to roll back and may still hold prepared resources: {}",
                            self.transaction_id, registration.name, err
                        );
                        state.record_failure(failure(&registration, Phase::Rollback, err));
                    }
                }
            }
            let next = if failed {
                TransactionStatus::Failed
            } else {
                TransactionStatus::RolledBack
            };
            state.transition("finish rollback", next)?;
            next
        };
        self.finish(status);
        Ok(status)
    }

    /// Cleans up after the caller walked away mid-transaction.
    ///
    /// Only called once PREPARE has been spawned, so `Pending` means the
    /// PREPARE task has not been polled yet. Waits for PREPARE to settle, then
    /// rolls back if the transaction was left prepared.
    pub(crate) async fn abandon(self: Arc<Self>) {
        let mut status_rx = self.subscribe();
        loop {
            let status = *status_rx.borrow_and_update();
            match status {
                TransactionStatus::Pending | TransactionStatus::Preparing => {
                    if status_rx.changed().await.is_err() {
                        return;
                    }
                }
                TransactionStatus::Prepared => {
                    warn!(
                        "Transaction {}: scope dropped while prepared, rolling back",
                        self.transaction_id
                    );
                    if let Err(err) = Arc::clone(&self).rollback().await {
                        debug!(
                            "Transaction {}: rollback of abandoned scope skipped: {}",
                            self.transaction_id, err
                        );
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    fn registrations_for(&self, ids: &[ParticipantId]) -> Vec<Registration> {
        let registry = self.registry.read();
        registry
            .list()
            .iter()
            .filter(|registration| ids.contains(&registration.id))
            .cloned()
            .collect()
    }

    fn finish(&self, status: TransactionStatus) {
        self.registry.write().release();
        match status {
            TransactionStatus::Committed => {
                info!("Transaction {} committed", self.transaction_id)
            }
            TransactionStatus::RolledBack => {
                info!("Transaction {} rolled back", self.transaction_id)
            }
            _ => error!(
                "Transaction {} ended {}; manual reconciliation may be required",
                self.transaction_id, status
            ),
        }
    }

    /// Issues one phase to all `targets` and waits for every result.
    ///
    /// Results come back in registration order.
    async fn fan_out(
        &self,
        phase: Phase,
        targets: Vec<Registration>,
        deadline: Option<Instant>,
    ) -> Vec<(Registration, ParticipantResult)> {
        let width = self.config.fan_out_width(targets.len());
        let mut results: Vec<_> = stream::iter(
            targets
                .into_iter()
                .map(|registration| self.call(phase, registration, deadline)),
        )
        .buffer_unordered(width)
        .collect()
        .await;
        results.sort_by_key(|(registration, _)| registration.id);
        results
    }

    /// One bounded participant call. Panics and timeouts become typed failures.
    async fn call(
        &self,
        phase: Phase,
        registration: Registration,
        deadline: Option<Instant>,
    ) -> (Registration, ParticipantResult) {
        let budget = match deadline {
            Some(deadline) => self
                .config
                .participant_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.participant_timeout,
        };
        let txn = &self.transaction_id;
        let participant = &registration.participant;
        let request = async move {
            match phase {
                Phase::Prepare => participant.prepare(txn).await,
                Phase::Commit => participant.commit(txn).await,
                Phase::Rollback => participant.rollback(txn).await,
            }
        };

        let outcome = match timeout(budget, AssertUnwindSafe(request).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ParticipantError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(ParticipantError::Timeout(budget)),
        };
        debug!(
            "Transaction {}: {} on {} ({}) -> {:?}",
            self.transaction_id, phase, registration.name, registration.id, outcome
        );
        (registration, outcome)
    }
}

fn failure(registration: &Registration, phase: Phase, error: ParticipantError) -> FailureRecord {
    FailureRecord {
        participant_id: registration.id,
        participant_name: registration.name.clone(),
        phase,
        error,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
