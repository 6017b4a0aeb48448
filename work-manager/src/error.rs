//! Error kinds surfaced to callers of the work manager.
//!
//! Most of spec.md §7's error kinds are not represented here:
//! `TransactionLookupFailure` degrades silently to immediate enqueue,
//! `JobFailure` is recorded on the job itself (the pool keeps running),
//! `Interrupted` and `ShutdownTimeout` are communicated as `bool`/`Option`
//! return values rather than errors, matching the blocking-call contract
//! in spec.md §5.

use thiserror::Error;

/// Errors the work manager surfaces directly to a caller.
#[derive(Debug, Error)]
pub enum WorkManagerError {
    /// `schedule` was called on work that was not in the `Scheduled` state.
    #[error("work must be in the Scheduled state to be submitted, was {actual:?}")]
    InvalidState {
        /// The state the work was actually observed in.
        actual: crate::job::WorkState,
    },

    /// `get_executor`/queue lookup referenced a queue id with no descriptor
    /// and no fallback to the default queue.
    #[error("no queue registered for id `{0}` and no default queue is configured")]
    UnknownQueue(String),

    /// The manager has already been shut down; its queue table is gone.
    #[error("work manager has been shut down")]
    ManagerShutDown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WorkManagerError>;
