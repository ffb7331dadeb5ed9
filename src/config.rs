use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound for a single participant call.
pub const DEFAULT_PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables of a [`DistributedUnitOfWork`](crate::DistributedUnitOfWork).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UowConfig {
    /// Upper bound for each `prepare`, `commit` and `rollback` call.
    /// A call exceeding it counts as a failure of that participant.
    pub participant_timeout: Duration,
    /// Upper bound for the whole transaction, measured from the start of
    /// PREPARE. Running out of it while preparing forces the abort path.
    pub transaction_timeout: Option<Duration>,
    /// Cap on participant calls in flight during one phase. `None` fans out
    /// to every participant at once.
    pub max_concurrency: Option<usize>,
}

impl Default for UowConfig {
    fn default() -> Self {
        Self {
            participant_timeout: DEFAULT_PARTICIPANT_TIMEOUT,
            transaction_timeout: None,
            max_concurrency: None,
        }
    }
}

impl UowConfig {
    /// Bound on each single participant call.
    pub fn with_participant_timeout(mut self, timeout: Duration) -> Self {
        self.participant_timeout = timeout;
        self
    }

    /// Bound on the whole PREPARE phase, measured from its start.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    /// Caps how many participant calls of a phase run at once.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Number of calls allowed in flight for a phase over `participants` targets.
    pub(crate) fn fan_out_width(&self, participants: usize) -> usize {
        match self.max_concurrency {
            Some(limit) => limit.max(1),
            None => participants.max(1),
        }
    }
}
