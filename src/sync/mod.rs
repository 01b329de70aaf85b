//! Sync engine - queued mutations replayed against the system of record
//!
//! Handles:
//! - Durable per-target FIFO queue with retry and dead-letter states
//! - Exponential backoff with jitter
//! - Concurrent dispatch in separate lanes for structured writes and uploads

pub mod engine;
pub mod mutation;
pub mod queue;
pub mod retry;

// Re-exports
pub use engine::{Lanes, SyncEngine, SyncReport, UploadOutcome};
pub use mutation::{
    ChecklistPatch, DeadReason, Mutation, MutationId, MutationPayload, MutationStatus,
    MutationType, QueueCounts, ResultPatch, UploadImage,
};
pub use queue::{EnqueueOutcome, MutationQueue, Settled};
pub use retry::RetryPolicy;
