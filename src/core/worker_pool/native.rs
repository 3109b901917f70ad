//! Native `WorkerPool` on OS threads.
//!
//! Each worker blocks on a bounded crossbeam channel and runs tasks on its
//! own single-threaded tokio runtime. Availability is a busy counter under a
//! mutex with a condvar, so the dispatch loop sleeps instead of polling.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;

use super::{PoolCounters, PoolError, PoolStats, PoolTask, WorkerPool};

/// Tasks accepted but not yet finished.
#[derive(Debug, Default)]
struct Availability {
    busy: Mutex<usize>,
    changed: Condvar,
}

impl Availability {
    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = busy.saturating_sub(1);
        drop(busy);
        self.changed.notify_all();
    }
}

/// Fixed-size pool of worker threads.
pub struct ThreadPool {
    config: WorkerPoolConfig,

    /// Dropped on shutdown so idle workers see a closed channel.
    task_tx: Mutex<Option<Sender<PoolTask>>>,

    counters: Arc<PoolCounters>,

    availability: Arc<Availability>,

    shutdown: AtomicBool,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ThreadPool {
    /// Spawn `config.worker_count` worker threads.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] for a bad configuration,
    /// [`PoolError::Internal`] if a thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (task_tx, task_rx) = bounded::<PoolTask>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());
        let availability = Arc::new(Availability::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let spawned = spawn_worker(
                worker_id,
                &config,
                task_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&availability),
            );
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Close the channel so the threads already started exit
                    drop(task_tx);
                    return Err(e);
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            prefix = %config.thread_name_prefix,
            "worker pool initialized"
        );

        Ok(Self {
            config,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            availability,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
        })
    }

    /// The pool's configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl WorkerPool for ThreadPool {
    fn run(&self, task: PoolTask) -> Result<(), PoolError> {
        let task_tx = self.task_tx.lock();
        let Some(tx) = task_tx.as_ref() else {
            self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::PoolShutdown);
        };

        *self.availability.busy.lock() += 1;
        self.counters.queued_tasks.fetch_add(1, Ordering::Relaxed);
        let sent = tx.try_send(task);
        if sent.is_err() {
            self.counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);
        }
        match sent {
            Ok(()) => {
                self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.availability.release();
                self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                warn!("worker pool queue is full");
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.availability.release();
                self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::PoolShutdown)
            }
        }
    }

    fn block_for_available(&self, timeout: Duration) -> usize {
        let deadline = Instant::now().checked_add(timeout);
        let mut busy = self.availability.busy.lock();
        loop {
            if self.is_shutdown() {
                return 0;
            }
            let free = self.config.worker_count.saturating_sub(*busy);
            if free > 0 {
                return free;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .availability
                        .changed
                        .wait_until(&mut busy, deadline)
                        .timed_out()
                    {
                        return self.config.worker_count.saturating_sub(*busy);
                    }
                }
                None => self.availability.changed.wait(&mut busy),
            }
        }
    }

    fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    fn shutdown(&self, wait: bool) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(wait, "shutting down worker pool");

        // Workers drain what is queued, then see the closed channel
        self.task_tx.lock().take();
        self.availability.changed.notify_all();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if !wait {
            debug!(count = workers.len(), "detaching worker threads");
            return;
        }
        let worker_count = workers.len();
        for (idx, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                warn!(worker_id = idx, "worker thread panicked");
            }
        }
        info!(worker_count, "worker pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Never join here; an explicit shutdown does that
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.task_tx.lock().take();
            debug!("thread pool dropped without explicit shutdown; workers detached");
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    config: &WorkerPoolConfig,
    task_rx: Receiver<PoolTask>,
    counters: Arc<PoolCounters>,
    availability: Arc<Availability>,
) -> Result<JoinHandle<()>, PoolError> {
    thread::Builder::new()
        .name(format!("{}-{worker_id}", config.thread_name_prefix))
        .stack_size(config.thread_stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    return;
                }
            };

            // recv fails once the sender is dropped and the channel is empty
            while let Ok(task) = task_rx.recv() {
                counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);
                counters.active_tasks.fetch_add(1, Ordering::Relaxed);

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&rt)));

                counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
                if outcome.is_ok() {
                    counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.failed_tasks.fetch_add(1, Ordering::Relaxed);
                    error!(worker_id, "worker task panicked");
                }
                availability.release();
            }

            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| PoolError::Internal(format!("failed to spawn worker {worker_id}: {e}")))
}
