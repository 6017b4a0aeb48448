//! Per-queue work pool executor (spec.md §4.D).
//!
//! Owns the five ordered lists under one monitor (`scheduledAfterCommit`,
//! `scheduled`, `running`, `completed`, `suspended`), the fixed-size worker
//! threads, the dispatch queue (spec.md §4.C), and the metrics for this
//! queue. Lock discipline follows spec.md §5: the monitor is always
//! acquired before touching the lists, and is never held while a call may
//! block on the dispatch queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::descriptor::QueueDescriptor;
use crate::job::{Work, WorkState};
use crate::metrics::MetricsSink;
use crate::queue::{BoundedQueue, PriorityQueue, UnboundedQueue, WorkQueue};
use crate::transaction::{TransactionManager, TransactionStatus, TransactionSynchronization};

/// Which logical list a [`WorkPool::find`]/[`WorkPool::list_work`] call
/// targets. `Scheduled` covers `scheduled ∪ scheduledAfterCommit` as one
/// logical set for all user-visible purposes (spec.md §4.D, §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkListState {
    Running,
    Scheduled,
    Completed,
    Suspended,
}

/// Outcome of running the shutdown protocol on a single queue (spec.md
/// §4.D). `saved` is the serialized state of every job that ended up
/// SUSPENDED, handed back for a host-supplied save sink; the sink itself is
/// not this crate's concern (spec.md §9 Open Questions).
#[derive(Debug, Default, Clone)]
pub struct ShutdownReport {
    /// Whether the pool reached quiescence within the requested timeout.
    pub terminated: bool,
    pub saved: Vec<serde_json::Value>,
}

#[derive(Default)]
struct PoolLists {
    scheduled_after_commit: Vec<Arc<dyn Work>>,
    scheduled: Vec<Arc<dyn Work>>,
    running: Vec<Arc<dyn Work>>,
    completed: Vec<Arc<dyn Work>>,
    suspended: Vec<Arc<dyn Work>>,
}

/// A single queue's worker pool: fixed-size threads over one dispatch
/// queue, plus the lifecycle bookkeeping spec.md §3/§4.D require.
pub struct WorkPool {
    queue_id: String,
    descriptor: QueueDescriptor,
    max_threads: usize,
    queue: Arc<WorkQueue>,
    lists: Mutex<PoolLists>,
    metrics: Arc<dyn MetricsSink>,
    transaction_manager: Arc<dyn TransactionManager>,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_prefix: String,
}

impl WorkPool {
    /// Builds the dispatch queue and spawns the worker threads. Returned
    /// already wrapped in `Arc` because worker threads and transaction
    /// synchronizations both need a handle back into the pool.
    pub fn new(
        descriptor: QueueDescriptor,
        transaction_manager: Arc<dyn TransactionManager>,
        worker_prefix: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let worker_prefix = worker_prefix.into();
        let max_threads = descriptor.effective_max_threads();

        let queue = if descriptor.use_priority {
            WorkQueue::Priority(PriorityQueue::new())
        } else if let Some(capacity) = descriptor.effective_capacity() {
            WorkQueue::Bounded(BoundedQueue::new(capacity, worker_prefix.clone()))
        } else {
            WorkQueue::Unbounded(UnboundedQueue::new())
        };

        let pool = Arc::new(Self {
            queue_id: descriptor.id.clone(),
            descriptor,
            max_threads,
            queue: Arc::new(queue),
            lists: Mutex::new(PoolLists::default()),
            metrics,
            transaction_manager,
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            worker_prefix,
        });
        pool.spawn_workers();
        pool
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut handles = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for index in 0..self.max_threads {
            let pool = Arc::clone(self);
            let name = format!("{}{}-{}", pool.worker_prefix, pool.queue_id, index);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || pool.worker_loop())
                .expect("failed to spawn work pool thread");
            handles.push(handle);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            match self.queue.take(Duration::from_millis(200)) {
                Some(job) => self.run_one(&job),
                None => {
                    if self.shutting_down.load(Ordering::Acquire) {
                        return;
                    }
                }
            }
        }
    }

    fn run_one(self: &Arc<Self>, job: &Arc<dyn Work>) {
        self.before_execute(job);
        let started = Instant::now();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.run()));
        let ok = matches!(result, Ok(true));
        if result.is_err() {
            tracing::warn!(queue_id = %self.queue_id, job_id = %job.id(), "work panicked; recorded as failure");
        }
        self.after_execute(job, ok, started.elapsed());
    }

    fn before_execute(&self, job: &Arc<dyn Work>) {
        {
            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            lists.scheduled.retain(|j| !Arc::ptr_eq(j, job));
            job.before_run();
            lists.running.push(Arc::clone(job));
        }
        self.metrics.add_scheduled(&self.queue_id, -1);
        self.metrics.add_running(&self.queue_id, 1);
        tracing::debug!(queue_id = %self.queue_id, job_id = %job.id(), "work started");
    }

    fn after_execute(&self, job: &Arc<dyn Work>, ok: bool, elapsed: Duration) {
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        job.after_run(ok);
        lists.running.retain(|j| !Arc::ptr_eq(j, job));
        self.metrics.add_running(&self.queue_id, -1);
        if job.state() == WorkState::Suspended {
            lists.suspended.push(Arc::clone(job));
        } else {
            lists.completed.push(Arc::clone(job));
            self.metrics.incr_completed(&self.queue_id);
        }
        drop(lists);
        self.metrics.observe_work(&self.queue_id, elapsed);
        tracing::debug!(queue_id = %self.queue_id, job_id = %job.id(), ok, "work finished");
    }

    /// Submit path (spec.md §4.D). Never blocks while `after_commit` and a
    /// transaction is active; otherwise may block inside the dispatch
    /// queue's backpressure (spec.md §5).
    pub fn execute(self: &Arc<Self>, job: Arc<dyn Work>, after_commit: bool) {
        if self.shutting_down.load(Ordering::Acquire) {
            // Diverted by the shutdown rejection policy (spec.md §4.D step 1).
            job.request_suspend();
            self.lists
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .suspended
                .push(job);
            return;
        }

        self.metrics.add_scheduled(&self.queue_id, 1);

        if after_commit {
            if let Some(tx) = self.transaction_manager.current() {
                if tx.is_active() {
                    let job_id = job.id();
                    self.lists
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .scheduled_after_commit
                        .push(Arc::clone(&job));
                    tx.register_synchronization(Box::new(AfterCommitSync {
                        pool: Arc::clone(self),
                        job,
                    }));
                    tracing::debug!(queue_id = %self.queue_id, job_id = %job_id, "parked work pending transaction commit");
                    return;
                }
            }
            tracing::warn!(
                queue_id = %self.queue_id,
                job_id = %job.id(),
                "after_commit requested but no active transaction; degrading to immediate enqueue"
            );
        }

        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scheduled
            .push(Arc::clone(&job));
        self.queue.offer(job);
    }

    /// spec.md §4.D `find`: searches lists in priority order RUNNING, then
    /// SCHEDULED ∪ scheduledAfterCommit, then COMPLETED, unless `state`
    /// restricts the search to one logical list.
    pub fn find(
        &self,
        job: &Arc<dyn Work>,
        state: Option<WorkListState>,
        use_equals: bool,
    ) -> Option<(WorkListState, usize)> {
        let matches = |candidate: &Arc<dyn Work>| -> bool {
            if use_equals {
                job.equals(candidate.as_ref())
            } else {
                Arc::ptr_eq(job, candidate)
            }
        };
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        let order = match state {
            Some(s) => vec![s],
            None => vec![
                WorkListState::Running,
                WorkListState::Scheduled,
                WorkListState::Completed,
            ],
        };
        for s in order {
            let found = match s {
                WorkListState::Running => lists.running.iter().position(matches),
                WorkListState::Scheduled => lists
                    .scheduled
                    .iter()
                    .position(matches)
                    .or_else(|| lists.scheduled_after_commit.iter().position(matches)),
                WorkListState::Completed => lists.completed.iter().position(matches),
                WorkListState::Suspended => lists.suspended.iter().position(matches),
            };
            if let Some(pos) = found {
                return Some((s, pos));
            }
        }
        None
    }

    /// spec.md §4.D `cancelScheduled`.
    pub fn cancel_scheduled(&self, job: &Arc<dyn Work>, use_equals: bool) -> bool {
        let matches = |candidate: &Arc<dyn Work>| -> bool {
            if use_equals {
                job.equals(candidate.as_ref())
            } else {
                Arc::ptr_eq(job, candidate)
            }
        };
        let removed_from_queue = self.queue.remove_matching(|candidate| matches(candidate));
        if removed_from_queue.is_empty() {
            return false;
        }

        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        for list in [&mut lists.scheduled_after_commit, &mut lists.scheduled] {
            let mut index = 0;
            while index < list.len() {
                if matches(&list[index]) {
                    let removed = list.remove(index);
                    removed.set_canceled();
                    self.metrics.add_scheduled(&self.queue_id, -1);
                } else {
                    index += 1;
                }
            }
        }
        true
    }

    /// Snapshot of the requested logical list. `state == None` means
    /// "non-completed" = `running ∪ scheduled ∪ scheduledAfterCommit`
    /// (spec.md §4.F `listWork`).
    pub fn list_work(&self, state: Option<WorkListState>) -> Vec<Arc<dyn Work>> {
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        match state {
            None => lists
                .running
                .iter()
                .chain(lists.scheduled.iter())
                .chain(lists.scheduled_after_commit.iter())
                .cloned()
                .collect(),
            Some(WorkListState::Running) => lists.running.clone(),
            Some(WorkListState::Scheduled) => lists
                .scheduled
                .iter()
                .chain(lists.scheduled_after_commit.iter())
                .cloned()
                .collect(),
            Some(WorkListState::Completed) => lists.completed.clone(),
            Some(WorkListState::Suspended) => lists.suspended.clone(),
        }
    }

    /// spec.md §4.F `getNonCompletedWorkSize`.
    pub fn non_completed_size(&self) -> usize {
        let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        lists.running.len() + lists.scheduled.len() + lists.scheduled_after_commit.len()
    }

    /// Drops every entry from `completed` (spec.md §4.F `clearCompletedWork`).
    pub fn clear_completed(&self) {
        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
            .clear();
    }

    /// Drops `completed` entries whose `completion_time` is older than
    /// `cutoff`, or falls back to this queue's own
    /// `clear_completed_after` descriptor setting when `cutoff` is `None`
    /// (spec.md §4.F per-queue `cleanup`).
    pub fn cleanup(&self, cutoff: Option<chrono::DateTime<chrono::Utc>>) {
        let cutoff = match cutoff.or_else(|| {
            let age = self.descriptor.clear_completed_after?;
            let age = chrono::Duration::from_std(age).ok()?;
            Some(chrono::Utc::now() - age)
        }) {
            Some(cutoff) => cutoff,
            None => return,
        };
        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
            .retain(|job| match job.completion_time() {
                Some(t) => t >= cutoff,
                None => true,
            });
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// spec.md §4.D shutdown protocol. Broadcasts suspend, waits up to
    /// `timeout` for quiescence, drains whatever is left, then snapshots and
    /// clears `suspended` for the save hook (step 5).
    pub fn shutdown(self: &Arc<Self>, timeout: Duration) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::Release);

        {
            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            for job in lists.running.iter().chain(lists.scheduled.iter()) {
                job.request_suspend();
            }
            // A job parked here may never see its transaction commit or roll
            // back before the pool tears down; move it into `suspended` now
            // rather than leaving it stuck SUSPENDED-but-still-scheduled
            // (spec.md §8 invariant 1).
            let parked = std::mem::take(&mut lists.scheduled_after_commit);
            for job in parked {
                job.request_suspend();
                lists.suspended.push(job);
            }
        }

        let deadline = Instant::now() + timeout;
        let terminated = loop {
            {
                let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                if lists.running.is_empty() && self.queue.len() == 0 {
                    break true;
                }
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        if !terminated {
            let remaining = self.queue.remove_matching(|_| true);
            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            for job in remaining {
                lists.scheduled.retain(|j| !Arc::ptr_eq(j, &job));
                job.request_suspend();
                lists.suspended.push(job);
            }
        }

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.join();
        }

        let saved = self.drain_suspended_for_save();
        ShutdownReport { terminated, saved }
    }

    /// spec.md §4.D step 5: snapshot `suspended`, clear it, and hand back
    /// the serializable state of every entry whose state is `Suspended`.
    /// What happens to the returned data (the save sink) is not this
    /// crate's concern (spec.md §9 Open Questions). Called internally by
    /// [`WorkPool::shutdown`]; exposed so a caller that needs the save data
    /// outside the normal shutdown path (e.g. a periodic save) can reach it
    /// directly.
    pub fn drain_suspended_for_save(&self) -> Vec<serde_json::Value> {
        let suspended = std::mem::take(
            &mut self.lists.lock().unwrap_or_else(|e| e.into_inner()).suspended,
        );
        suspended
            .iter()
            .filter(|job| job.state() == WorkState::Suspended)
            .filter_map(|job| job.get_data())
            .collect()
    }
}

/// Registered against the ambient transaction when a job is submitted with
/// `after_commit = true` (spec.md §4.E).
struct AfterCommitSync {
    pool: Arc<WorkPool>,
    job: Arc<dyn Work>,
}

impl TransactionSynchronization for AfterCommitSync {
    fn after_completion(&self, status: TransactionStatus) {
        if self.job.state() != WorkState::Scheduled {
            // Already canceled or suspended by something else; no-op.
            return;
        }

        let was_present = {
            let mut lists = self.pool.lists.lock().unwrap_or_else(|e| e.into_inner());
            let before = lists.scheduled_after_commit.len();
            lists
                .scheduled_after_commit
                .retain(|j| !Arc::ptr_eq(j, &self.job));
            lists.scheduled_after_commit.len() < before
        };
        if !was_present {
            return;
        }

        match status {
            TransactionStatus::Committed => {
                self.pool
                    .lists
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .scheduled
                    .push(Arc::clone(&self.job));
                self.pool.queue.offer(Arc::clone(&self.job));
            }
            TransactionStatus::RolledBack => {
                self.job.set_canceled();
                self.pool.metrics.add_scheduled(&self.pool.queue_id, -1);
            }
            TransactionStatus::Other => {
                tracing::warn!(
                    queue_id = %self.pool.queue_id,
                    job_id = %self.job.id(),
                    "transaction finished with an unrecognized status; dropping after-commit work"
                );
                self.pool.metrics.add_scheduled(&self.pool.queue_id, -1);
            }
        }
    }
}
