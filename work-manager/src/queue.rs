//! The dispatch queue backing a pool (spec.md §4.C).
//!
//! Three modes, selected by [`crate::descriptor::QueueDescriptor`]:
//!
//! - [`BoundedQueue`]: FIFO with user-visible capacity `C`. `offer` blocks
//!   rather than rejecting, so a caller gets producer backpressure instead
//!   of job loss. Internally it allocates `2C` slots and reserves the
//!   second half for re-entrant producers (worker threads of the same pool
//!   submitting a follow-up job) so a pool whose workers all submit
//!   follow-ups cannot deadlock itself against a full queue.
//! - An unbounded FIFO for descriptors with `capacity == 0`.
//! - [`PriorityQueue`]: unbounded, ordered by [`crate::job::Work::priority_key`].
//!
//! None of the teacher crate's dependencies provide this; it is grounded on
//! the general `crossbeam-channel` bounded-MPMC idiom this corpus reaches
//! for elsewhere (see DESIGN.md) rather than a hand-rolled channel.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::job::Work;

/// How long the rate-limiting spin sleeps between checks (spec.md §4.C).
const RATE_LIMIT_SLEEP: Duration = Duration::from_millis(100);

fn is_reentrant_thread(worker_prefix: &str) -> bool {
    std::thread::current()
        .name()
        .is_some_and(|name| name.starts_with(worker_prefix))
}

/// Bounded FIFO with the re-entrant bypass described in spec.md §4.C.
pub struct BoundedQueue {
    sender: Sender<Arc<dyn Work>>,
    receiver: Receiver<Arc<dyn Work>>,
    /// The user-visible capacity `C`; the channel itself holds `2C`.
    capacity: usize,
    rate_limit_lock: Mutex<()>,
    remove_lock: Mutex<()>,
    worker_prefix: String,
}

impl BoundedQueue {
    pub fn new(capacity: usize, worker_prefix: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity * 2);
        Self {
            sender,
            receiver,
            capacity,
            rate_limit_lock: Mutex::new(()),
            remove_lock: Mutex::new(()),
            worker_prefix: worker_prefix.into(),
        }
    }

    /// Blocks until there is room. Re-entrant producers (worker threads of
    /// this same pool) bypass the rate limit and draw from the reserved
    /// half directly; external producers are throttled to keep at least
    /// `capacity` slots free for them.
    pub fn offer(&self, job: Arc<dyn Work>) {
        if is_reentrant_thread(&self.worker_prefix) {
            let _ = self.sender.send(job);
            return;
        }

        let _guard = self
            .rate_limit_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut job = job;
        loop {
            if self.sender.len() < self.capacity {
                match self.sender.try_send(job) {
                    Ok(()) => return,
                    Err(TrySendError::Full(returned)) => job = returned,
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            std::thread::sleep(RATE_LIMIT_SLEEP);
        }
    }

    pub fn take(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn remove_matching(
        &self,
        mut predicate: impl FnMut(&Arc<dyn Work>) -> bool,
    ) -> Vec<Arc<dyn Work>> {
        let _guard = self.remove_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            if predicate(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        for item in kept {
            // We hold remove_lock, and nothing but a reentrant bypass send
            // (bounded by the reserved half) can race us here, so this
            // cannot spuriously fail to find room for items we just took out.
            let _ = self.sender.try_send(item);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }
}

/// Unbounded FIFO for descriptors with `capacity == 0` and no priority.
pub struct UnboundedQueue {
    sender: Sender<Arc<dyn Work>>,
    receiver: Receiver<Arc<dyn Work>>,
    remove_lock: Mutex<()>,
}

impl UnboundedQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            remove_lock: Mutex::new(()),
        }
    }

    pub fn offer(&self, job: Arc<dyn Work>) {
        let _ = self.sender.send(job);
    }

    pub fn take(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn remove_matching(
        &self,
        mut predicate: impl FnMut(&Arc<dyn Work>) -> bool,
    ) -> Vec<Arc<dyn Work>> {
        let _guard = self.remove_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            if predicate(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        for item in kept {
            let _ = self.sender.send(item);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }
}

impl Default for UnboundedQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct PriorityItem {
    priority: i64,
    seq: u64,
    job: Arc<dyn Work>,
}

impl PartialEq for PriorityItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PriorityItem {}

impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; higher priority pops first, and among
        // equal priorities the earlier-enqueued (lower seq) pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Unbounded priority queue used when a descriptor sets `use_priority`
/// (spec.md §4.C). Capacity is ignored entirely in this mode.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<PriorityItem>>,
    not_empty: Condvar,
    seq: AtomicU64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            not_empty: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn offer(&self, job: Arc<dyn Work>) {
        let priority = job.priority_key();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(PriorityItem { priority, seq, job });
        self.not_empty.notify_one();
    }

    pub fn take(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = heap.pop() {
                return Some(item.job);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timeout_result) = self
                .not_empty
                .wait_timeout(heap, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            heap = guard;
            if timeout_result.timed_out() && heap.is_empty() {
                return None;
            }
        }
    }

    pub fn remove_matching(
        &self,
        mut predicate: impl FnMut(&Arc<dyn Work>) -> bool,
    ) -> Vec<Arc<dyn Work>> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let items: Vec<PriorityItem> = std::mem::take(&mut *heap).into_vec();
        let mut removed = Vec::new();
        for item in items {
            if predicate(&item.job) {
                removed.push(item.job);
            } else {
                heap.push(item);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatch queue a pool hands jobs to and pulls them back from.
pub enum WorkQueue {
    Bounded(BoundedQueue),
    Unbounded(UnboundedQueue),
    Priority(PriorityQueue),
}

impl WorkQueue {
    pub fn offer(&self, job: Arc<dyn Work>) {
        match self {
            WorkQueue::Bounded(q) => q.offer(job),
            WorkQueue::Unbounded(q) => q.offer(job),
            WorkQueue::Priority(q) => q.offer(job),
        }
    }

    pub fn take(&self, timeout: Duration) -> Option<Arc<dyn Work>> {
        match self {
            WorkQueue::Bounded(q) => q.take(timeout),
            WorkQueue::Unbounded(q) => q.take(timeout),
            WorkQueue::Priority(q) => q.take(timeout),
        }
    }

    pub fn remove_matching(
        &self,
        predicate: impl FnMut(&Arc<dyn Work>) -> bool,
    ) -> Vec<Arc<dyn Work>> {
        match self {
            WorkQueue::Bounded(q) => q.remove_matching(predicate),
            WorkQueue::Unbounded(q) => q.remove_matching(predicate),
            WorkQueue::Priority(q) => q.remove_matching(predicate),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WorkQueue::Bounded(q) => q.len(),
            WorkQueue::Unbounded(q) => q.len(),
            WorkQueue::Priority(q) => q.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BaseWork;

    struct TestWork {
        base: BaseWork,
        priority: i64,
    }

    impl TestWork {
        fn new(priority: i64) -> Arc<dyn Work> {
            Arc::new(Self {
                base: BaseWork::new(),
                priority,
            })
        }
    }

    impl Work for TestWork {
        fn run(&self) -> bool {
            true
        }
        fn state(&self) -> crate::job::WorkState {
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
        fn priority_key(&self) -> i64 {
            self.priority
        }
    }

    #[test]
    fn bounded_queue_fifo_order() {
        let q = BoundedQueue::new(4, "wm-worker-");
        for _ in 0..4 {
            q.offer(TestWork::new(0));
        }
        for _ in 0..4 {
            assert!(q.take(Duration::from_millis(50)).is_some());
        }
        assert!(q.take(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn bounded_queue_reentrant_bypass_does_not_block() {
        let q = Arc::new(BoundedQueue::new(1, "wm-worker-"));
        q.offer(TestWork::new(0)); // fills the external half

        let q2 = q.clone();
        let handle = std::thread::Builder::new()
            .name("wm-worker-0".to_string())
            .spawn(move || {
                // reentrant: should not block despite the external half
                // already being full, since it draws from the reserved half.
                q2.offer(TestWork::new(0));
            })
            .unwrap();
        handle.join().unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn bounded_queue_external_producer_blocks_until_room() {
        let q = Arc::new(BoundedQueue::new(1, "wm-worker-"));
        q.offer(TestWork::new(0));

        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            q2.offer(TestWork::new(0));
        });

        std::thread::sleep(Duration::from_millis(250));
        assert!(!handle.is_finished());

        q.take(Duration::from_millis(50)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn bounded_queue_remove_matching_preserves_remaining_order() {
        let q = BoundedQueue::new(4, "wm-worker-");
        let a = TestWork::new(0);
        let b = TestWork::new(0);
        let c = TestWork::new(0);
        q.offer(a.clone());
        q.offer(b.clone());
        q.offer(c.clone());

        let removed = q.remove_matching(|job| Arc::ptr_eq(job, &b));
        assert_eq!(removed.len(), 1);

        let first = q.take(Duration::from_millis(50)).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        let second = q.take(Duration::from_millis(50)).unwrap();
        assert!(Arc::ptr_eq(&second, &c));
    }

    #[test]
    fn priority_queue_orders_by_priority_key() {
        let q = PriorityQueue::new();
        q.offer(TestWork::new(1));
        q.offer(TestWork::new(5));
        q.offer(TestWork::new(3));

        let first = q.take(Duration::from_millis(50)).unwrap();
        assert_eq!(first.priority_key(), 5);
        let second = q.take(Duration::from_millis(50)).unwrap();
        assert_eq!(second.priority_key(), 3);
        let third = q.take(Duration::from_millis(50)).unwrap();
        assert_eq!(third.priority_key(), 1);
    }

    #[test]
    fn priority_queue_is_fifo_among_equal_priority() {
        let q = PriorityQueue::new();
        let a = TestWork::new(0);
        let b = TestWork::new(0);
        q.offer(a.clone());
        q.offer(b.clone());

        let first = q.take(Duration::from_millis(50)).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
    }

    #[test]
    fn unbounded_queue_never_blocks() {
        let q = UnboundedQueue::new();
        for _ in 0..1000 {
            q.offer(TestWork::new(0));
        }
        assert_eq!(q.len(), 1000);
    }
}
