//! Transaction-gated submission (spec.md §4.E).
//!
//! The manager only consumes a transaction's commit/rollback callbacks
//! (spec.md §1 "Out of scope: the transaction manager itself"), so this
//! module defines the two small traits a host transaction manager
//! implements plus, for tests and demos, an in-memory transaction good
//! enough to exercise the commit/rollback paths without a real database.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome reported to a registered synchronization (spec.md §4.E, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Committed,
    RolledBack,
    /// Any other status (spec.md §4.E: "log and drop").
    Other,
}

/// A two-method callback registered against an active transaction
/// (spec.md §6 "Transaction hook").
pub trait TransactionSynchronization: Send + Sync {
    /// Called before the transaction finishes. A no-op for this crate's own
    /// use (spec.md §4.E), provided so host transaction managers that
    /// always invoke both hooks have something to call.
    fn before_completion(&self) {}

    /// Called once the transaction has finished, with its outcome.
    fn after_completion(&self, status: TransactionStatus);
}

/// A single ambient transaction, as seen by the work manager. Only the
/// two operations the manager needs are exposed; everything else about
/// the transaction (isolation, savepoints, ...) is the host's concern.
pub trait Transaction: Send + Sync {
    fn is_active(&self) -> bool;
    fn register_synchronization(&self, sync: Box<dyn TransactionSynchronization>);
}

/// Looks up whatever transaction (if any) is ambient on the calling
/// thread. A lookup failure (spec.md §7 `TransactionLookupFailure`) is not
/// represented as an `Err` here — a manager with nothing to report just
/// returns `None`, which the pool treats identically: degrade to immediate
/// enqueue.
pub trait TransactionManager: Send + Sync {
    fn current(&self) -> Option<Arc<dyn Transaction>>;
}

/// A transaction manager with no ambient transaction, ever. Using this
/// makes every `after_commit` submission behave as an immediate enqueue
/// (spec.md §4.E degrade path).
#[derive(Debug, Default)]
pub struct NoopTransactionManager;

impl TransactionManager for NoopTransactionManager {
    fn current(&self) -> Option<Arc<dyn Transaction>> {
        None
    }
}

/// An in-memory transaction for tests and demos. Collects registered
/// synchronizations and fires them in registration order on `commit`/
/// `rollback`.
#[derive(Default)]
pub struct TestTransaction {
    active: AtomicBool,
    syncs: Mutex<Vec<Box<dyn TransactionSynchronization>>>,
}

impl TestTransaction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(true),
            syncs: Mutex::new(Vec::new()),
        })
    }

    fn finish(&self, status: TransactionStatus) {
        self.active.store(false, Ordering::Release);
        let syncs = std::mem::take(&mut *self.syncs.lock().unwrap_or_else(|e| e.into_inner()));
        for sync in &syncs {
            sync.before_completion();
        }
        for sync in syncs {
            sync.after_completion(status);
        }
    }

    pub fn commit(&self) {
        self.finish(TransactionStatus::Committed);
    }

    pub fn rollback(&self) {
        self.finish(TransactionStatus::RolledBack);
    }
}

impl Transaction for TestTransaction {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn register_synchronization(&self, sync: Box<dyn TransactionSynchronization>) {
        self.syncs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sync);
    }
}

thread_local! {
    static CURRENT_TEST_TRANSACTION: RefCell<Option<Arc<TestTransaction>>> = const { RefCell::new(None) };
}

/// Binds a fresh [`TestTransaction`] as ambient on the calling thread and
/// returns a handle to it. Pair with [`end_test_transaction`], or prefer
/// [`with_test_transaction`].
pub fn begin_test_transaction() -> Arc<TestTransaction> {
    let tx = TestTransaction::new();
    CURRENT_TEST_TRANSACTION.with(|cell| *cell.borrow_mut() = Some(tx.clone()));
    tx
}

pub fn end_test_transaction() {
    CURRENT_TEST_TRANSACTION.with(|cell| *cell.borrow_mut() = None);
}

/// Runs `body` with a fresh ambient transaction bound on this thread,
/// unbinding it afterwards regardless of how `body` returns.
pub fn with_test_transaction<R>(body: impl FnOnce(&Arc<TestTransaction>) -> R) -> R {
    let tx = begin_test_transaction();
    let result = body(&tx);
    end_test_transaction();
    result
}

/// A [`TransactionManager`] that reads the thread-local bound by
/// [`begin_test_transaction`].
#[derive(Debug, Default)]
pub struct TestTransactionManager;

impl TransactionManager for TestTransactionManager {
    fn current(&self) -> Option<Arc<dyn Transaction>> {
        CURRENT_TEST_TRANSACTION
            .with(|cell| cell.borrow().clone())
            .map(|tx| tx as Arc<dyn Transaction>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSync {
        statuses: Arc<Mutex<Vec<TransactionStatus>>>,
    }

    impl TransactionSynchronization for RecordingSync {
        fn after_completion(&self, status: TransactionStatus) {
            self.statuses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(status);
        }
    }

    #[test]
    fn commit_fires_registered_synchronizations() {
        let tx = TestTransaction::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        tx.register_synchronization(Box::new(RecordingSync {
            statuses: statuses.clone(),
        }));
        assert!(tx.is_active());
        tx.commit();
        assert!(!tx.is_active());
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![TransactionStatus::Committed]
        );
    }

    #[test]
    fn rollback_fires_registered_synchronizations() {
        let tx = TestTransaction::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        tx.register_synchronization(Box::new(RecordingSync {
            statuses: statuses.clone(),
        }));
        tx.rollback();
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![TransactionStatus::RolledBack]
        );
    }

    #[test]
    fn noop_manager_never_has_a_current_transaction() {
        let mgr = NoopTransactionManager;
        assert!(mgr.current().is_none());
    }

    #[test]
    fn test_transaction_manager_sees_bound_transaction() {
        let mgr = TestTransactionManager;
        assert!(mgr.current().is_none());
        with_test_transaction(|_tx| {
            assert!(mgr.current().is_some());
        });
        assert!(mgr.current().is_none());
    }

    #[test]
    fn order_of_synchronizations_is_registration_order() {
        let tx = TestTransaction::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let order = order.clone();
            let counter = counter.clone();
            struct Indexed {
                order: Arc<Mutex<Vec<usize>>>,
                counter: Arc<AtomicUsize>,
            }
            impl TransactionSynchronization for Indexed {
                fn after_completion(&self, _status: TransactionStatus) {
                    let i = self.counter.fetch_add(1, Ordering::SeqCst);
                    self.order.lock().unwrap().push(i);
                }
            }
            tx.register_synchronization(Box::new(Indexed { order, counter }));
        }
        tx.commit();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
