//! Worker pool submission contract.
//!
//! The dispatch loop hands each confirmed fire to a [`WorkerPool`] and never
//! waits for it. Before acquiring a batch it asks the pool how many threads
//! are free with [`WorkerPool::block_for_available`], so it never claims
//! more triggers than it can start.
//!
//! [`ThreadPool`] is the native implementation: dedicated OS threads, each
//! with its own current-thread tokio runtime so async job bodies can run
//! without touching the caller's runtime.

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::SchedulerError;

pub use native::ThreadPool;

/// Work item run on a worker thread with access to that worker's runtime.
pub type PoolTask = Box<dyn FnOnce(&tokio::runtime::Runtime) + Send + 'static>;

/// Errors that can occur when using a worker pool.
#[derive(Debug)]
pub enum PoolError {
    /// The task channel is full.
    QueueFull,

    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (thread spawn failure, runtime creation, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "task queue is full"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<PoolError> for SchedulerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::PoolShutdown => Self::Shutdown,
            PoolError::InvalidConfig(msg) => Self::InvalidConfig(msg),
            other => Self::Pool(other.to_string()),
        }
    }
}

/// Snapshot of pool utilization.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Tasks currently executing.
    pub active_tasks: u64,

    /// Tasks waiting in the channel.
    pub queued_tasks: u64,

    /// Tasks that returned normally.
    pub completed_tasks: u64,

    /// Tasks that panicked.
    pub failed_tasks: u64,

    /// Tasks accepted by `run`.
    pub submitted_tasks: u64,

    /// Submissions refused.
    pub rejected_tasks: u64,
}

/// Thread-safe counters behind [`PoolStats`].
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
    pub rejected_tasks: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
        }
    }
}

/// Executes fires on behalf of the dispatch loop.
pub trait WorkerPool: Send + Sync {
    /// Hand `task` to a worker without waiting for it to run.
    ///
    /// # Errors
    ///
    /// [`PoolError::QueueFull`] when no slot is free, [`PoolError::PoolShutdown`]
    /// after shutdown.
    fn run(&self, task: PoolTask) -> Result<(), PoolError>;

    /// Wait up to `timeout` for at least one free worker and return how many
    /// are free. Returns 0 on timeout or after shutdown.
    fn block_for_available(&self, timeout: Duration) -> usize;

    /// Number of workers.
    fn worker_count(&self) -> usize;

    /// Utilization snapshot.
    fn stats(&self) -> PoolStats;

    /// Stop accepting work. Queued tasks still run; with `wait` the call
    /// returns once every worker has exited.
    fn shutdown(&self, wait: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        assert_eq!(PoolError::QueueFull.to_string(), "task queue is full");
        assert_eq!(
            PoolError::Internal("boom".into()).to_string(),
            "internal error: boom"
        );
    }

    #[test]
    fn test_pool_error_into_scheduler_error() {
        assert!(matches!(
            SchedulerError::from(PoolError::PoolShutdown),
            SchedulerError::Shutdown
        ));
        assert!(matches!(
            SchedulerError::from(PoolError::QueueFull),
            SchedulerError::Pool(_)
        ));
    }
}
