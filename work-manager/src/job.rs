//! The work job contract.
//!
//! `Work` is the capability set the pool invokes at exact state transitions.
//! The manager never inspects *what* a job does — only the state machine it
//! exposes. [`BaseWork`] is a composable helper a concrete job can embed so
//! it does not have to hand-roll the atomic bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Lifecycle state of a unit of work.
///
/// `Scheduled -> Running -> {Completed | Failed | Suspended | Canceled}`.
/// Once a job leaves `Scheduled` it never returns to it; a caller that wants
/// to run the same logical work again submits a new `Work` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkState {
    Scheduled = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Suspended = 4,
    Canceled = 5,
}

impl WorkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkState::Scheduled,
            1 => WorkState::Running,
            2 => WorkState::Completed,
            3 => WorkState::Failed,
            4 => WorkState::Suspended,
            _ => WorkState::Canceled,
        }
    }

    /// True for the states the pool treats as "done" for bookkeeping
    /// purposes (moved into the `completed` list).
    pub fn is_completed_bucket(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }

    /// True once the job can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkState::Completed | WorkState::Failed | WorkState::Canceled | WorkState::Suspended
        )
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkState::Scheduled => "SCHEDULED",
            WorkState::Running => "RUNNING",
            WorkState::Completed => "COMPLETED",
            WorkState::Failed => "FAILED",
            WorkState::Suspended => "SUSPENDED",
            WorkState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// The capability set a job exposes to the pool.
///
/// Implementers fall into three informal variants the pool does not need to
/// distinguish: idempotent jobs (safe to re-run), transactional jobs (the
/// implementer starts/commits its own transaction inside `run`), and
/// long-running cooperative jobs that poll [`Work::suspend_requested`] from
/// inside `run` and return early at a checkpoint.
pub trait Work: Send + Sync + std::any::Any {
    /// Run the job body. Returns whether it completed successfully; a panic
    /// unwinding out of `run` is treated by the pool as `false`.
    fn run(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> WorkState;

    /// Stable id used in logging. Jobs built on [`BaseWork`] get a random
    /// one for free; a job with no meaningful id can leave this at the
    /// default nil id.
    fn id(&self) -> Uuid {
        Uuid::nil()
    }

    /// Optional category string used to resolve a queue.
    fn category(&self) -> Option<&str> {
        None
    }

    /// Called by the pool immediately before `run`, under the pool monitor.
    /// Transitions `Scheduled -> Running` and records `start_time`.
    fn before_run(&self);

    /// Called by the pool immediately after `run` returns, under the pool
    /// monitor. Transitions `Running -> {Completed | Failed}` and records
    /// `completion_time` regardless of `ok`.
    fn after_run(&self, ok: bool);

    /// Cooperative suspend request. Returns `true` if the job transitioned
    /// to `Suspended` as a direct result of
    /// this call (true for jobs that were not yet running); long-running
    /// jobs instead record the request and transition later, from inside
    /// `run`, once they reach a checkpoint.
    fn request_suspend(&self) -> bool;

    /// Has a suspend been requested? Cooperative long-running jobs poll this
    /// from inside `run`.
    fn suspend_requested(&self) -> bool {
        false
    }

    /// Advisory cancellation. A job already `Running` is not
    /// force-killed; a job still `Scheduled` is guaranteed by the pool to
    /// have been pulled out of the dispatch queue before this is called.
    fn set_canceled(&self);

    /// Wall-clock time `before_run` was invoked.
    fn start_time(&self) -> Option<DateTime<Utc>>;

    /// Wall-clock time `after_run`/suspend completed.
    fn completion_time(&self) -> Option<DateTime<Utc>>;

    /// Serializable snapshot handed to the shutdown-save hook; the sink
    /// itself is not defined here. Jobs with nothing worth saving can
    /// leave this `None`.
    fn get_data(&self) -> Option<serde_json::Value> {
        None
    }

    /// User-defined dedup equality: lets two distinct instances count as
    /// the same logical job. Defaults to `false`, i.e. every instance is
    /// only equal to itself via identity, never via this method.
    fn equals(&self, _other: &dyn Work) -> bool {
        false
    }

    /// Ordering key for priority queues. Higher runs sooner.
    /// Ignored entirely unless the owning queue descriptor sets
    /// `use_priority`.
    fn priority_key(&self) -> i64 {
        0
    }

    /// Enables downcasting to a concrete type. An `equals` implementation
    /// that needs to compare concrete fields downcasts `other` through
    /// this; the default body is all any implementer needs to write.
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Pointer identity for two jobs, independent of [`Work::equals`]. Used by
/// the find/cancel machinery alongside the user-defined equality above.
pub fn identity_eq(a: &Arc<dyn Work>, b: &Arc<dyn Work>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Atomic state-machine bookkeeping a concrete `Work` implementation can
/// embed by composition instead of hand-rolling.
pub struct BaseWork {
    id: Uuid,
    state: AtomicU8,
    suspend_requested: AtomicBool,
    start_time: Mutex<Option<DateTime<Utc>>>,
    completion_time: Mutex<Option<DateTime<Utc>>>,
}

impl Default for BaseWork {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseWork {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(WorkState::Scheduled as u8),
            suspend_requested: AtomicBool::new(false),
            start_time: Mutex::new(None),
            completion_time: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: WorkState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn before_run(&self) {
        self.set_state(WorkState::Running);
        *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub fn after_run(&self, ok: bool) {
        self.set_state(if ok {
            WorkState::Completed
        } else {
            WorkState::Failed
        });
        *self
            .completion_time
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    /// CAS-based suspend: only takes effect from `Scheduled`, which is the
    /// case for jobs diverted by the shutdown rejection policy before ever
    /// starting. `Running` jobs only get the request flag set; they must
    /// call [`BaseWork::cooperative_suspend`] themselves from inside `run`.
    pub fn request_suspend(&self) -> bool {
        self.suspend_requested.store(true, Ordering::Release);
        let transitioned = self
            .state
            .compare_exchange(
                WorkState::Scheduled as u8,
                WorkState::Suspended as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            *self
                .completion_time
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
        transitioned
    }

    pub fn suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Called from inside a long-running job's own `run` body once it
    /// reaches a cooperative checkpoint. Transitions `Running -> Suspended`.
    pub fn cooperative_suspend(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                WorkState::Running as u8,
                WorkState::Suspended as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            *self
                .completion_time
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
        transitioned
    }

    /// Marks the job canceled. Idempotent; a no-op once the job has already
    /// reached a terminal state.
    pub fn set_canceled(&self) {
        let current = self.state();
        if !current.is_terminal() {
            self.set_state(WorkState::Canceled);
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        *self
            .completion_time
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
