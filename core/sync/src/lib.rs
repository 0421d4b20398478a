//! Sanctuary Sync Engine
//!
//! Offline-first optimistic sync for reader state, including:
//! - Persisted, deduplicating mutation queues with debounced flushing
//! - Capped exponential backoff retried indefinitely
//! - Revision-based optimistic updates with rollback
//! - Reconciliation of remote snapshots with unacknowledged local edits

pub mod channels;
pub mod engine;
pub mod entity;
pub mod meta;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod timer;

// Re-export main types
pub use channels::{
    ProgressChannel, ProgressQueue, SessionChannel, SessionQueue, PROGRESS_QUEUE_KEY,
    SESSION_QUEUE_KEY,
};
pub use engine::{EngineConfig, FlushReport, SyncEngine, SyncIndicator};
pub use entity::{Entity, EntitySync, SnapshotMark};
pub use meta::{AckOutcome, Revision, SyncMeta};
pub use queue::{
    FlushOutcome, MutationQueue, Payload, PendingMutation, QueueChannel, QueueConfig, QueueState,
};
pub use reconcile::{reconcile, Disposition, Reconcilable, ReconcileReport, Reconciled};
pub use retry::{Backoff, RetryConfig, RetryExecutor};
pub use timer::FlushTimer;
