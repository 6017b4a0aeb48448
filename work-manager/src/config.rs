//! Process-level configuration (SPEC_FULL.md A.3), grounded on the
//! teacher's `Config::from_env` (dotenvy + anyhow::Context).
//!
//! Nothing here is required to use the crate — [`WorkManagerConfig::default`]
//! is a complete, working configuration — but a host application that wants
//! its deployment knobs in the environment gets the same loading convention
//! the rest of the teacher's stack uses.

use std::time::Duration;

use anyhow::Context;

/// Knobs a host application may want to override per-deployment. Everything
/// here has a sensible default; nothing is required to construct a
/// [`crate::manager::WorkManager`].
#[derive(Debug, Clone)]
pub struct WorkManagerConfig {
    /// Prefix worker threads are named with, used by the bounded dispatch
    /// queue to detect re-entrant submissions (spec.md §4.C).
    pub worker_thread_prefix: String,

    /// Queue id used when a job's category has no binding (spec.md §4.B).
    pub default_queue_id: String,

    /// Upper bound `WorkManager::shutdown` waits for outstanding work before
    /// giving up and suspending the remainder (spec.md §4.D).
    pub shutdown_timeout: Duration,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self {
            worker_thread_prefix: "wm-worker-".to_string(),
            default_queue_id: crate::descriptor::DEFAULT_QUEUE_ID.to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkManagerConfig {
    /// Loads overrides from the environment (and a `.env` file, if present),
    /// falling back to [`WorkManagerConfig::default`] for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("WORK_MANAGER_WORKER_PREFIX") {
            config.worker_thread_prefix = prefix;
        }
        if let Ok(queue_id) = std::env::var("WORK_MANAGER_DEFAULT_QUEUE_ID") {
            config.default_queue_id = queue_id;
        }
        if let Ok(secs) = std::env::var("WORK_MANAGER_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("WORK_MANAGER_SHUTDOWN_TIMEOUT_SECS must be an integer")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable_without_env() {
        let config = WorkManagerConfig::default();
        assert_eq!(config.worker_thread_prefix, "wm-worker-");
        assert_eq!(config.default_queue_id, "default");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }
}
