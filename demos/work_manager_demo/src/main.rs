//! Small end-to-end walkthrough of [`work_manager`], run with
//! `cargo run -p work-manager-demo`. Registers two queues, schedules work
//! under a few different scheduling policies, waits for it to drain, and
//! logs the final counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use work_manager::job::BaseWork;
use work_manager::{
    AtomicMetrics, NoopTransactionManager, QueueDescriptor, SchedulingPolicy, Work, WorkManager,
    WorkManagerConfig, WorkState,
};

struct PrintWork {
    base: BaseWork,
    label: String,
    category: Option<String>,
    ran: Arc<AtomicUsize>,
}

impl PrintWork {
    fn new(label: impl Into<String>, ran: Arc<AtomicUsize>) -> Arc<dyn Work> {
        Arc::new(Self {
            base: BaseWork::new(),
            label: label.into(),
            category: None,
            ran,
        })
    }

    fn with_category(label: impl Into<String>, category: impl Into<String>, ran: Arc<AtomicUsize>) -> Arc<dyn Work> {
        Arc::new(Self {
            base: BaseWork::new(),
            label: label.into(),
            category: Some(category.into()),
            ran,
        })
    }
}

impl Work for PrintWork {
    fn run(&self) -> bool {
        tracing::info!(job_id = %self.id(), label = %self.label, "running");
        std::thread::sleep(Duration::from_millis(50));
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
    fn id(&self) -> uuid::Uuid {
        self.base.id()
    }
    fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }
    fn equals(&self, other: &dyn Work) -> bool {
        other
            .as_any()
            .downcast_ref::<PrintWork>()
            .is_some_and(|o| o.label == self.label)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkManagerConfig::from_env().context("failed to load work manager config")?;
    tracing::info!("starting work manager demo");

    let manager = Arc::new(WorkManager::new(
        Arc::new(NoopTransactionManager),
        Arc::new(AtomicMetrics::new()),
        config,
    ));
    manager.register_contribution(
        QueueDescriptor::builder()
            .id("default")
            .name("default")
            .max_threads(2)
            .capacity(16)
            .build(),
    );
    manager.register_contribution(
        QueueDescriptor::builder()
            .id("reports")
            .name("reports")
            .category_bindings(vec!["report".to_string()])
            .max_threads(1)
            .capacity(8)
            .build(),
    );
    manager.activate();
    tracing::info!("queues registered");

    let ran = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        manager.schedule(
            PrintWork::new(format!("job-{i}"), ran.clone()),
            SchedulingPolicy::Enqueue,
            false,
        )?;
    }

    // scheduling the same logical job twice under IfNotScheduled: the
    // second submission is skipped while the first is still pending.
    manager.schedule(
        PrintWork::new("dedup-me", ran.clone()),
        SchedulingPolicy::Enqueue,
        false,
    )?;
    manager.schedule(
        PrintWork::new("dedup-me", ran.clone()),
        SchedulingPolicy::IfNotScheduled,
        false,
    )?;

    // routed to the "reports" queue via its category binding rather than
    // the default queue.
    manager.schedule(
        PrintWork::with_category("quarterly-report", "report", ran.clone()),
        SchedulingPolicy::Enqueue,
        false,
    )?;

    let drained = manager.await_completion(
        &["default".to_string(), "reports".to_string()],
        Duration::from_secs(5),
    );
    tracing::info!(drained, ran = ran.load(Ordering::SeqCst), "queues settled");

    manager.cleanup();
    let report = manager.shutdown_with_default_timeout();
    tracing::info!(
        terminated = report.terminated,
        saved = report.saved.len(),
        "work manager demo finished"
    );

    Ok(())
}
