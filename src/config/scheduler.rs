//! Scheduler configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pool::{WorkerPoolConfig, DEFAULT_THREAD_STACK_SIZE};

/// `instance_id` value that asks for a generated id.
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// Prefix of environment variables read by [`SchedulerConfig::from_env`].
pub const ENV_PREFIX: &str = "TRIGGER_DISPATCH_";

/// Root scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name used for thread names and log fields.
    pub instance_name: String,
    /// Instance id; [`AUTO_INSTANCE_ID`] generates a uuid.
    pub instance_id: String,
    /// Worker threads; 0 means one per CPU.
    pub thread_count: usize,
    /// Stack size of worker threads in bytes.
    pub thread_stack_size: usize,
    /// Most triggers acquired per batch.
    pub max_batch_size: usize,
    /// How far past the lookahead a batch may reach, in milliseconds.
    pub batch_time_window_ms: u64,
    /// Longest the dispatch loop sleeps when idle, in milliseconds.
    pub idle_wait_ms: u64,
    /// How late a trigger may be before it counts as misfired, in milliseconds.
    pub misfire_threshold_ms: u64,
    /// Pause after a failed store call, in milliseconds.
    pub store_retry_backoff_ms: u64,
    /// Whether shutdown waits for running jobs by default.
    pub wait_for_jobs_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "trigger-dispatch".into(),
            instance_id: AUTO_INSTANCE_ID.into(),
            thread_count: 0,
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            max_batch_size: 1,
            batch_time_window_ms: 0,
            idle_wait_ms: 30_000,
            misfire_threshold_ms: 60_000,
            store_retry_backoff_ms: 15_000,
            wait_for_jobs_on_shutdown: true,
        }
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>, String> {
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{key}: cannot parse `{raw}`")),
        Err(_) => Ok(None),
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_name.trim().is_empty() {
            return Err("instance_name must not be empty".into());
        }
        if self.instance_id.trim().is_empty() {
            return Err("instance_id must not be empty".into());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".into());
        }
        if self.idle_wait_ms == 0 {
            return Err("idle_wait_ms must be greater than 0".into());
        }
        if self.store_retry_backoff_ms == 0 {
            return Err("store_retry_backoff_ms must be greater than 0".into());
        }
        self.worker_pool_config()
            .validate()
            .map_err(|e| format!("worker pool invalid: {e}"))
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `TRIGGER_DISPATCH_*` environment variables,
    /// after loading a `.env` file if one exists.
    ///
    /// # Errors
    ///
    /// Returns a message for unparsable values or failed validation.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(v) = env_var("INSTANCE_NAME")? {
            cfg.instance_name = v;
        }
        if let Some(v) = env_var("INSTANCE_ID")? {
            cfg.instance_id = v;
        }
        if let Some(v) = env_var("THREAD_COUNT")? {
            cfg.thread_count = v;
        }
        if let Some(v) = env_var("THREAD_STACK_SIZE")? {
            cfg.thread_stack_size = v;
        }
        if let Some(v) = env_var("MAX_BATCH_SIZE")? {
            cfg.max_batch_size = v;
        }
        if let Some(v) = env_var("BATCH_TIME_WINDOW_MS")? {
            cfg.batch_time_window_ms = v;
        }
        if let Some(v) = env_var("IDLE_WAIT_MS")? {
            cfg.idle_wait_ms = v;
        }
        if let Some(v) = env_var("MISFIRE_THRESHOLD_MS")? {
            cfg.misfire_threshold_ms = v;
        }
        if let Some(v) = env_var("STORE_RETRY_BACKOFF_MS")? {
            cfg.store_retry_backoff_ms = v;
        }
        if let Some(v) = env_var("WAIT_FOR_JOBS_ON_SHUTDOWN")? {
            cfg.wait_for_jobs_on_shutdown = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Instance id with [`AUTO_INSTANCE_ID`] resolved.
    #[must_use]
    pub fn resolved_instance_id(&self) -> String {
        if self.instance_id == AUTO_INSTANCE_ID {
            Uuid::new_v4().to_string()
        } else {
            self.instance_id.clone()
        }
    }

    /// Worker thread count with 0 resolved to the CPU count.
    #[must_use]
    pub fn resolved_thread_count(&self) -> usize {
        if self.thread_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.thread_count
        }
    }

    /// Pool configuration derived from this configuration.
    #[must_use]
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let workers = self.resolved_thread_count();
        WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_max_queue_depth(workers)
            .with_thread_stack_size(self.thread_stack_size)
            .with_thread_name_prefix(format!("{}-worker", self.instance_name))
    }

    /// Batch time window.
    #[must_use]
    pub const fn batch_time_window(&self) -> Duration {
        Duration::from_millis(self.batch_time_window_ms)
    }

    /// Idle wait.
    #[must_use]
    pub const fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Misfire threshold.
    #[must_use]
    pub const fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    /// Store retry backoff.
    #[must_use]
    pub const fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }
}
