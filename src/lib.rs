pub mod config;
mod engine;
pub mod errors;
pub mod participant;
pub mod participants;
pub mod registry;
pub mod state;
pub mod transaction_id;
pub mod uow;

// Re-export key types and structs for easier access
pub use config::UowConfig;
pub use errors::{BoxError, ParticipantError, Result, TransactionFailure, UowError};
pub use participant::{Participant, ParticipantId, ParticipantResult};
pub use participants::{Behavior, MockParticipant, QueueParticipant, StoreParticipant};
pub use registry::{ParticipantRegistry, Registration};
pub use state::{FailureRecord, Phase, StatusSnapshot, TransactionStatus};
pub use transaction_id::TransactionId;
pub use uow::{DistributedUnitOfWork, prelude};
