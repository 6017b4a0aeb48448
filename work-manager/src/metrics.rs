//! Metrics sink (spec.md §6): four named counters per queue
//! (`scheduled`, `scheduled-max`, `running`, `completed`) and one timer
//! (`work`, recorded here in microseconds, as spec.md §6 prescribes for
//! storage). No metrics crate in the teacher's remaining dependency stack
//! covers this (see DESIGN.md), so the trait is the extension point and
//! [`AtomicMetrics`] is a dependency-free default good enough for this
//! crate's own use and tests. A pool takes its sink as `Arc<dyn MetricsSink>`
//! (threaded through from [`crate::manager::WorkManager::new`]), so a host
//! can hand the manager its own Prometheus/StatsD bridge instead of
//! `AtomicMetrics`.
//!
//! `queue_id` is passed to every method the way a real backend would use it
//! as a label, since one sink is shared across every pool a manager creates.
//! `AtomicMetrics` ignores the label and aggregates across all queues, which
//! is enough for this crate's own tests; a host bridging into a real
//! multi-queue-aware backend uses the parameter as that backend's label.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Pluggable metrics backend. A host application implements this to bridge
/// into Prometheus, StatsD, or whatever it already uses; nothing in this
/// crate assumes a particular backend. Every method is additive/observational
/// (push-only), matching how real metrics backends are driven — there is no
/// read-back API on the trait itself.
pub trait MetricsSink: Send + Sync {
    /// Adjust the `scheduled` gauge for `queue_id` by `delta` (spec.md §3:
    /// incremented on submit, decremented on `before_execute`).
    fn add_scheduled(&self, queue_id: &str, delta: i64);
    /// Adjust the `running` gauge for `queue_id` by `delta`.
    fn add_running(&self, queue_id: &str, delta: i64);
    /// Record one more completed job for `queue_id` (monotonic).
    fn incr_completed(&self, queue_id: &str);
    /// Record one job's wall-clock duration for `queue_id`.
    fn observe_work(&self, queue_id: &str, duration: Duration);
}

/// In-process counters, no external dependency. `scheduled`/`running` are
/// the current list sizes (spec.md §3); `completed` and `scheduled_max` are
/// monotonic high-water marks. Implements [`MetricsSink`] directly; the
/// read-back accessors below it (`scheduled()`, `scheduled_max()`, ...) are
/// inherent, not part of the trait, since a caller reaching for them already
/// knows it's holding this concrete type rather than some other host's sink.
#[derive(Default)]
pub struct AtomicMetrics {
    scheduled: AtomicI64,
    scheduled_max: AtomicI64,
    running: AtomicI64,
    completed: AtomicU64,
    work_count: AtomicU64,
    work_sum_micros: AtomicU64,
    work_max_micros: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> i64 {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn scheduled_max(&self) -> i64 {
        self.scheduled_max.load(Ordering::Acquire)
    }

    pub fn running(&self) -> i64 {
        self.running.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Average observed job duration in seconds (spec.md §6: microseconds
    /// for storage, seconds for reporting).
    pub fn average_work_seconds(&self) -> f64 {
        let count = self.work_count.load(Ordering::Acquire);
        if count == 0 {
            return 0.0;
        }
        let sum = self.work_sum_micros.load(Ordering::Acquire) as f64;
        (sum / count as f64) / 1_000_000.0
    }

    pub fn max_work_seconds(&self) -> f64 {
        self.work_max_micros.load(Ordering::Acquire) as f64 / 1_000_000.0
    }
}

impl MetricsSink for AtomicMetrics {
    fn add_scheduled(&self, _queue_id: &str, delta: i64) {
        let new_value = self.scheduled.fetch_add(delta, Ordering::AcqRel) + delta;
        self.scheduled_max.fetch_max(new_value, Ordering::AcqRel);
    }

    fn add_running(&self, _queue_id: &str, delta: i64) {
        self.running.fetch_add(delta, Ordering::AcqRel);
    }

    fn incr_completed(&self, _queue_id: &str) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn observe_work(&self, _queue_id: &str, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        self.work_count.fetch_add(1, Ordering::AcqRel);
        self.work_sum_micros.fetch_add(micros, Ordering::AcqRel);
        self.work_max_micros.fetch_max(micros, Ordering::AcqRel);
    }
}
