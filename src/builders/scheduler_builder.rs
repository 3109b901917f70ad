//! Builder wiring a [`Scheduler`] from configuration and optional overrides.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::listener::{BroadcastTriggerListener, TriggerListener};
use crate::core::scheduler::Scheduler;
use crate::core::store::TriggerStore;
use crate::core::worker_pool::{ThreadPool, WorkerPool};
use crate::core::{SchedulerError, SchedulerResult};
use crate::infra::store::RamTriggerStore;
use crate::util::clock::{Clock, SystemClock};

/// Name of the broadcaster every scheduler fans listener callbacks through.
pub const BROADCAST_LISTENER_NAME: &str = "scheduler-listeners";

/// Assemble a scheduler. Anything not overridden comes from the config:
/// [`SystemClock`], a [`RamTriggerStore`] and a [`ThreadPool`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn TriggerStore>>,
    pool: Option<Arc<dyn WorkerPool>>,
    clock: Option<Arc<dyn Clock>>,
    listeners: Vec<Arc<dyn TriggerListener>>,
}

impl SchedulerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            pool: None,
            clock: None,
            listeners: Vec::new(),
        }
    }

    /// Use a custom trigger store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn TriggerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom worker pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Use a custom clock. A custom store must share it.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a trigger listener up front.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn TriggerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the configuration and build the scheduler, in standby.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] for a bad configuration or worker
    /// pool settings, [`SchedulerError::Pool`] if worker threads cannot start.
    pub fn build(self) -> SchedulerResult<Scheduler> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(RamTriggerStore::new(
                Arc::clone(&clock),
                self.config.misfire_threshold(),
            )),
        };
        let pool = match self.pool {
            Some(pool) => pool,
            None => Arc::new(ThreadPool::new(self.config.worker_pool_config())?),
        };

        let listeners = Arc::new(BroadcastTriggerListener::new(BROADCAST_LISTENER_NAME));
        for listener in self.listeners {
            listeners.add_listener(listener);
        }

        Scheduler::new(self.config, store, pool, clock, listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults_in_standby() {
        let config = SchedulerConfig {
            thread_count: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = SchedulerBuilder::new(config).build().unwrap();

        assert!(scheduler.is_in_standby());
        assert!(!scheduler.is_started());
        assert_eq!(scheduler.pool_stats().worker_count, 2);
        scheduler.shutdown(true);
        assert!(scheduler.is_shutdown());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = SchedulerConfig {
            max_batch_size: 0,
            ..SchedulerConfig::default()
        };
        let err = SchedulerBuilder::new(config).build().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }
}
