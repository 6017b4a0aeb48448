//! Transactional, multi-queue background work executor.
//!
//! A [`manager::WorkManager`] routes [`job::Work`] instances to named
//! [`pool::WorkPool`]s by category, each pool running a fixed worker-thread
//! count over its own dispatch queue (bounded FIFO, unbounded FIFO, or
//! priority — see [`queue`]). Submission can be gated on the calling
//! thread's ambient transaction (`after_commit = true`, see [`transaction`]),
//! so a job only actually runs once the work that scheduled it has
//! committed.
//!
//! This crate does not run a transaction manager, a config-file loader, or a
//! metrics backend of its own; it defines the seams ([`transaction::TransactionManager`],
//! [`metrics::MetricsSink`]) a host application wires up.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod transaction;

pub use config::WorkManagerConfig;
pub use descriptor::{DescriptorRegistry, QueueDescriptor, DEFAULT_QUEUE_ID};
pub use error::{Result, WorkManagerError};
pub use job::{BaseWork, Work, WorkState};
pub use manager::{SchedulingPolicy, WorkManager};
pub use metrics::{AtomicMetrics, MetricsSink};
pub use pool::{ShutdownReport, WorkListState, WorkPool};
pub use transaction::{
    NoopTransactionManager, Transaction, TransactionManager, TransactionStatus,
    TransactionSynchronization,
};
