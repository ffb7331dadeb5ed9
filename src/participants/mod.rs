//! Concrete participants: a staged key/value store, a transactional message
//! queue and a scripted mock for fault injection.

pub mod ledger;
pub mod mock;
pub mod queue;
pub mod store;

pub use ledger::{DEFAULT_LEDGER_RETENTION, LedgerState, PreparedLedger};
pub use mock::{Behavior, MockParticipant};
pub use queue::QueueParticipant;
pub use store::StoreParticipant;
