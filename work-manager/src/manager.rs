//! The work manager facade (spec.md §4.F).
//!
//! One [`WorkManager`] fronts every queue's [`WorkPool`]; pools are created
//! lazily and atomically on first use (spec.md §5 "create-or-get race"),
//! keyed by queue id in a [`DashMap`] the way the teacher's kernel keys its
//! command registries and connection pools.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::WorkManagerConfig;
use crate::descriptor::{DescriptorRegistry, QueueDescriptor};
use crate::error::{Result, WorkManagerError};
use crate::job::{Work, WorkState};
use crate::metrics::MetricsSink;
use crate::pool::{ShutdownReport, WorkListState, WorkPool};
use crate::transaction::TransactionManager;

/// How `schedule` should treat a job that may already be scheduled or
/// running (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// Always submit, regardless of what else is scheduled.
    Enqueue,
    /// Cancel every equal scheduled entry first, then submit.
    CancelScheduled,
    /// Skip submission if an equal job is already scheduled.
    IfNotScheduled,
    /// Skip submission if an equal job is already running.
    IfNotRunning,
    /// Skip submission if an equal job is running or scheduled.
    IfNotRunningOrScheduled,
}

/// Facade over every queue's pool. Construct one per process; `activate`
/// before scheduling anything, `shutdown` once at teardown.
pub struct WorkManager {
    registry: Mutex<DescriptorRegistry>,
    pools: DashMap<String, Arc<WorkPool>>,
    transaction_manager: Arc<dyn TransactionManager>,
    metrics: Arc<dyn MetricsSink>,
    config: WorkManagerConfig,
    active: AtomicBool,
}

impl WorkManager {
    /// `metrics` is shared across every queue's pool, the way a host's own
    /// Prometheus/StatsD bridge would be; each call into it carries the
    /// queue id as a label (spec.md §6). Pass `Arc::new(AtomicMetrics::new())`
    /// for the crate's own dependency-free default.
    pub fn new(
        transaction_manager: Arc<dyn TransactionManager>,
        metrics: Arc<dyn MetricsSink>,
        config: WorkManagerConfig,
    ) -> Self {
        let registry = DescriptorRegistry::with_default_queue_id(config.default_queue_id.clone());
        Self {
            registry: Mutex::new(registry),
            pools: DashMap::new(),
            transaction_manager,
            metrics,
            config,
            active: AtomicBool::new(false),
        }
    }

    /// Registers (or replaces) a queue's descriptor (spec.md §6
    /// `registerContribution`). Only affects queues created after the call;
    /// an already-running pool keeps its original descriptor.
    pub fn register_contribution(&self, descriptor: QueueDescriptor) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(descriptor);
    }

    /// Marks the manager ready to accept `schedule` calls.
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
        tracing::info!("work manager activated");
    }

    /// Stops accepting new `schedule` calls without tearing down existing
    /// pools (callers in flight can still be awaited via
    /// `await_completion`).
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn pool_for(&self, queue_id: &str) -> Result<Arc<WorkPool>> {
        if let Some(pool) = self.pools.get(queue_id) {
            return Ok(Arc::clone(&pool));
        }
        let descriptor = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .descriptor(queue_id)?;
        let pool = self
            .pools
            .entry(queue_id.to_string())
            .or_insert_with(|| {
                WorkPool::new(
                    descriptor,
                    Arc::clone(&self.transaction_manager),
                    self.config.worker_thread_prefix.clone(),
                    Arc::clone(&self.metrics),
                )
            })
            .clone();
        Ok(pool)
    }

    fn resolve_queue_id(&self, category: Option<&str>) -> Result<String> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue_id_for_category(category)
    }

    /// Submits `work` according to `scheduling` (spec.md §4.F). Routes to a
    /// queue using `work.category()`, falling back to the configured
    /// default queue (spec.md §4.B).
    pub fn schedule(
        &self,
        work: Arc<dyn Work>,
        scheduling: SchedulingPolicy,
        after_commit: bool,
    ) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Err(WorkManagerError::ManagerShutDown);
        }
        if work.state() != WorkState::Scheduled {
            return Err(WorkManagerError::InvalidState {
                actual: work.state(),
            });
        }

        let queue_id = self.resolve_queue_id(work.category())?;
        let pool = self.pool_for(&queue_id)?;

        match scheduling {
            SchedulingPolicy::Enqueue => {}
            SchedulingPolicy::CancelScheduled => {
                pool.cancel_scheduled(&work, true);
            }
            SchedulingPolicy::IfNotScheduled => {
                if pool
                    .find(&work, Some(WorkListState::Scheduled), true)
                    .is_some()
                {
                    work.set_canceled();
                    return Ok(());
                }
            }
            SchedulingPolicy::IfNotRunning => {
                if pool
                    .find(&work, Some(WorkListState::Running), true)
                    .is_some()
                {
                    work.set_canceled();
                    return Ok(());
                }
            }
            SchedulingPolicy::IfNotRunningOrScheduled => {
                let running = pool
                    .find(&work, Some(WorkListState::Running), true)
                    .is_some();
                let scheduled = running
                    || pool
                        .find(&work, Some(WorkListState::Scheduled), true)
                        .is_some();
                if scheduled {
                    work.set_canceled();
                    return Ok(());
                }
            }
        }

        pool.execute(work, after_commit);
        Ok(())
    }

    /// spec.md §4.D `cancelScheduled`, surfaced at the manager level.
    pub fn cancel_scheduled(&self, queue_id: &str, work: &Arc<dyn Work>, use_equals: bool) -> bool {
        self.pools
            .get(queue_id)
            .map(|pool| pool.cancel_scheduled(work, use_equals))
            .unwrap_or(false)
    }

    /// spec.md §4.D `find`, surfaced at the manager level.
    pub fn find(
        &self,
        queue_id: &str,
        work: &Arc<dyn Work>,
        state: Option<WorkListState>,
        use_equals: bool,
    ) -> Option<(WorkListState, usize)> {
        self.pools
            .get(queue_id)
            .and_then(|pool| pool.find(work, state, use_equals))
    }

    /// spec.md §4.F `listWork`. `queue_id == None` aggregates across every
    /// queue that has been created so far.
    pub fn list_work(&self, queue_id: Option<&str>, state: Option<WorkListState>) -> Vec<Arc<dyn Work>> {
        match queue_id {
            Some(id) => self
                .pools
                .get(id)
                .map(|pool| pool.list_work(state))
                .unwrap_or_default(),
            None => self
                .pools
                .iter()
                .flat_map(|pool| pool.list_work(state))
                .collect(),
        }
    }

    /// spec.md §4.F `getNonCompletedWorkSize`.
    pub fn get_non_completed_work_size(&self, queue_id: Option<&str>) -> usize {
        match queue_id {
            Some(id) => self
                .pools
                .get(id)
                .map(|pool| pool.non_completed_size())
                .unwrap_or(0),
            None => self.pools.iter().map(|pool| pool.non_completed_size()).sum(),
        }
    }

    /// Polls every 50ms until every queue in `queue_ids` has no
    /// non-completed work, or `timeout` elapses. Returns whether it drained
    /// in time.
    pub fn await_completion(&self, queue_ids: &[String], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining: usize = queue_ids
                .iter()
                .map(|id| self.get_non_completed_work_size(Some(id)))
                .sum();
            if remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// spec.md §4.F `clearCompletedWork`. `queue_id == None` clears every
    /// queue.
    pub fn clear_completed_work(&self, queue_id: Option<&str>) {
        match queue_id {
            Some(id) => {
                if let Some(pool) = self.pools.get(id) {
                    pool.clear_completed();
                }
            }
            None => {
                for pool in self.pools.iter() {
                    pool.clear_completed();
                }
            }
        }
    }

    /// Time-based completed-entry reclamation (spec.md §4.F `cleanup`),
    /// driven by each queue's own `clear_completed_after` descriptor
    /// setting.
    pub fn cleanup(&self) {
        for pool in self.pools.iter() {
            pool.cleanup(None);
        }
    }

    /// Shuts down and drops a single queue's pool (spec.md §4.D), returning
    /// whether it reached quiescence within `timeout` plus the save data for
    /// every job that ended up SUSPENDED. A queue that was never created
    /// trivially "shuts down" successfully with nothing to save.
    pub fn shutdown_queue(&self, queue_id: &str, timeout: Duration) -> ShutdownReport {
        match self.pools.remove(queue_id) {
            Some((_, pool)) => pool.shutdown(timeout),
            None => ShutdownReport {
                terminated: true,
                saved: Vec::new(),
            },
        }
    }

    /// Deactivates the manager and shuts down every queue, using the
    /// manager's configured default timeout for each. `terminated` is
    /// whether every queue reached quiescence in time; `saved` aggregates
    /// the save data from every queue's suspended work across the whole
    /// shutdown (spec.md §4.D step 5).
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.active.store(false, Ordering::Release);
        let ids: Vec<String> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        let mut all_terminated = true;
        let mut saved = Vec::new();
        for id in ids {
            let report = self.shutdown_queue(&id, timeout);
            if !report.terminated {
                all_terminated = false;
            }
            saved.extend(report.saved);
        }
        tracing::info!(all_terminated, saved = saved.len(), "work manager shut down");
        ShutdownReport {
            terminated: all_terminated,
            saved,
        }
    }

    pub fn shutdown_with_default_timeout(&self) -> ShutdownReport {
        self.shutdown(self.config.shutdown_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BaseWork;
    use crate::transaction::NoopTransactionManager;
    use std::sync::atomic::AtomicUsize;

    struct CountingWork {
        base: BaseWork,
        id: u64,
        ran: Arc<AtomicUsize>,
    }

    impl CountingWork {
        fn new(id: u64, ran: Arc<AtomicUsize>) -> Arc<dyn Work> {
            Arc::new(Self {
                base: BaseWork::new(),
                id,
                ran,
            })
        }
    }

    impl Work for CountingWork {
        fn run(&self) -> bool {
            std::thread::sleep(Duration::from_millis(20));
            self.ran.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn state(&self) -> WorkState {
            self.base.state()
        }
        fn before_run(&self) {
            self.base.before_run()
        }
        fn after_run(&self, ok: bool) {
            self.base.after_run(ok)
        }
        fn request_suspend(&self) -> bool {
            self.base.request_suspend()
        }
        fn set_canceled(&self) {
            self.base.set_canceled()
        }
        fn start_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            self.base.start_time()
        }
        fn completion_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            self.base.completion_time()
        }
        fn equals(&self, other: &dyn Work) -> bool {
            other
                .as_any()
                .downcast_ref::<CountingWork>()
                .is_some_and(|o| o.id == self.id)
        }
    }

    fn manager_with_default_queue(max_threads: i32, capacity: usize) -> WorkManager {
        let manager = WorkManager::new(
            Arc::new(NoopTransactionManager),
            Arc::new(crate::metrics::AtomicMetrics::new()),
            WorkManagerConfig::default(),
        );
        manager.register_contribution(
            QueueDescriptor::builder()
                .id("default")
                .name("default")
                .max_threads(max_threads)
                .capacity(capacity)
                .build(),
        );
        manager.activate();
        manager
    }

    #[test]
    fn schedule_rejects_non_scheduled_work() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        let work = CountingWork::new(1, ran);
        work.set_canceled();
        let err = manager
            .schedule(work, SchedulingPolicy::Enqueue, false)
            .unwrap_err();
        assert!(matches!(err, WorkManagerError::InvalidState { .. }));
    }

    #[test]
    fn schedule_rejects_when_not_active() {
        let manager = WorkManager::new(
            Arc::new(NoopTransactionManager),
            Arc::new(crate::metrics::AtomicMetrics::new()),
            WorkManagerConfig::default(),
        );
        manager.register_contribution(QueueDescriptor::builder().id("default").name("default").build());
        let ran = Arc::new(AtomicUsize::new(0));
        let work = CountingWork::new(1, ran);
        let err = manager
            .schedule(work, SchedulingPolicy::Enqueue, false)
            .unwrap_err();
        assert!(matches!(err, WorkManagerError::ManagerShutDown));
    }

    #[test]
    fn unknown_category_without_default_queue_errors() {
        let manager = WorkManager::new(
            Arc::new(NoopTransactionManager),
            Arc::new(crate::metrics::AtomicMetrics::new()),
            WorkManagerConfig::default(),
        );
        manager.activate();
        let ran = Arc::new(AtomicUsize::new(0));
        let work = CountingWork::new(1, ran);
        let err = manager
            .schedule(work, SchedulingPolicy::Enqueue, false)
            .unwrap_err();
        assert!(matches!(err, WorkManagerError::UnknownQueue(_)));
    }

    #[test]
    fn await_completion_waits_for_drain() {
        let manager = manager_with_default_queue(2, 8);
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..6 {
            manager
                .schedule(CountingWork::new(i, ran.clone()), SchedulingPolicy::Enqueue, false)
                .unwrap();
        }
        let drained = manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        assert!(drained);
        assert_eq!(ran.load(Ordering::SeqCst), 6);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn clear_completed_work_empties_the_bucket() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        manager
            .schedule(CountingWork::new(1, ran.clone()), SchedulingPolicy::Enqueue, false)
            .unwrap();
        manager.await_completion(&["default".to_string()], Duration::from_millis(500));
        assert_eq!(manager.list_work(Some("default"), Some(WorkListState::Completed)).len(), 1);
        manager.clear_completed_work(Some("default"));
        assert_eq!(manager.list_work(Some("default"), Some(WorkListState::Completed)).len(), 0);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn if_not_scheduled_skips_a_logically_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        // occupy the worker so the next submission actually sits scheduled.
        manager
            .schedule(
                CountingWork::new(99, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        manager
            .schedule(
                CountingWork::new(1, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        let duplicate = CountingWork::new(1, ran.clone());
        manager
            .schedule(duplicate.clone(), SchedulingPolicy::IfNotScheduled, false)
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        // the duplicate with id 1 must not have run twice, and is marked
        // canceled rather than silently dropped (spec.md §4.F).
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(duplicate.state(), WorkState::Canceled);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn cancel_scheduled_replaces_the_pending_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        manager
            .schedule(
                CountingWork::new(99, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let first = CountingWork::new(1, ran.clone());
        manager
            .schedule(first.clone(), SchedulingPolicy::Enqueue, false)
            .unwrap();
        manager
            .schedule(
                CountingWork::new(1, ran.clone()),
                SchedulingPolicy::CancelScheduled,
                false,
            )
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        assert_eq!(first.state(), WorkState::Canceled);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn if_not_running_skips_a_currently_running_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        let job = CountingWork::new(1, ran.clone());
        manager
            .schedule(job.clone(), SchedulingPolicy::Enqueue, false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(job.state(), WorkState::Running);

        let duplicate = CountingWork::new(1, ran.clone());
        manager
            .schedule(duplicate.clone(), SchedulingPolicy::IfNotRunning, false)
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        assert_eq!(duplicate.state(), WorkState::Canceled);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn if_not_running_does_not_skip_a_merely_scheduled_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        // occupy the single worker with an unrelated job so the next
        // submission sits in `scheduled` rather than `running`.
        manager
            .schedule(
                CountingWork::new(99, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        manager
            .schedule(
                CountingWork::new(1, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        let second = CountingWork::new(1, ran.clone());
        manager
            .schedule(second.clone(), SchedulingPolicy::IfNotRunning, false)
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        // IfNotRunning only consults the Running list, so a merely-scheduled
        // equal job does not block the new submission: both instances run.
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn if_not_running_or_scheduled_skips_a_running_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        let job = CountingWork::new(1, ran.clone());
        manager
            .schedule(job.clone(), SchedulingPolicy::Enqueue, false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(job.state(), WorkState::Running);

        let duplicate = CountingWork::new(1, ran.clone());
        manager
            .schedule(
                duplicate.clone(),
                SchedulingPolicy::IfNotRunningOrScheduled,
                false,
            )
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        assert_eq!(duplicate.state(), WorkState::Canceled);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn if_not_running_or_scheduled_skips_a_merely_scheduled_equal_job() {
        let manager = manager_with_default_queue(1, 4);
        let ran = Arc::new(AtomicUsize::new(0));
        manager
            .schedule(
                CountingWork::new(99, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        manager
            .schedule(
                CountingWork::new(1, ran.clone()),
                SchedulingPolicy::Enqueue,
                false,
            )
            .unwrap();
        let second = CountingWork::new(1, ran.clone());
        manager
            .schedule(
                second.clone(),
                SchedulingPolicy::IfNotRunningOrScheduled,
                false,
            )
            .unwrap();

        manager.await_completion(&["default".to_string()], Duration::from_millis(1000));
        assert_eq!(second.state(), WorkState::Canceled);
        // only the id-99 and the first id-1 instance ever run.
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        manager.shutdown(Duration::from_millis(200));
    }

    #[test]
    fn shutdown_tears_down_every_queue() {
        let manager = manager_with_default_queue(1, 4);
        assert!(manager.shutdown(Duration::from_millis(500)).terminated);
        assert!(!manager.is_active());
        assert_eq!(manager.get_non_completed_work_size(None), 0);
    }
}
