//! Scheduler facade.
//!
//! Ties the store, signal channel, listeners, worker pool and dispatch loop
//! together and exposes the job/trigger management surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::dispatch::{DispatchLoop, LoopSettings};
use crate::core::job::{JobDataMap, JobDetail, JobKey};
use crate::core::listener::{BroadcastTriggerListener, TriggerListener};
use crate::core::signal::SignalChannel;
use crate::core::store::{SchedulerSignaler, TriggerStore};
use crate::core::trigger::{MisfireInstruction, Trigger, TriggerBuilder, TriggerKey, TriggerState};
use crate::core::worker_pool::{PoolStats, WorkerPool};
use crate::core::{SchedulerError, SchedulerResult};
use crate::util::clock::Clock;

/// Group of the one-shot triggers created by [`Scheduler::trigger_job`].
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// Store-facing callbacks: misfires go to listeners, changes to the loop.
pub struct SchedulerSignalerImpl {
    signals: Arc<SignalChannel>,
    listeners: Arc<BroadcastTriggerListener>,
}

impl SchedulerSignalerImpl {
    /// Create a signaler feeding `signals` and `listeners`.
    pub const fn new(
        signals: Arc<SignalChannel>,
        listeners: Arc<BroadcastTriggerListener>,
    ) -> Self {
        Self { signals, listeners }
    }
}

impl SchedulerSignaler for SchedulerSignalerImpl {
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        futures::executor::block_on(self.listeners.broadcast_misfired(trigger));
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signals.signal(candidate);
    }
}

/// An in-process scheduler. Created in standby; call [`Scheduler::start`].
pub struct Scheduler {
    config: SchedulerConfig,
    instance_id: String,
    store: Arc<dyn TriggerStore>,
    pool: Arc<dyn WorkerPool>,
    signals: Arc<SignalChannel>,
    listeners: Arc<BroadcastTriggerListener>,
    clock: Arc<dyn Clock>,
    standby: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown: AtomicBool,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance_name", &self.config.instance_name)
            .field("instance_id", &self.instance_id)
            .field("started", &self.is_started())
            .field("standby", &self.is_in_standby())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Wire a scheduler from its parts. Prefer
    /// [`crate::builders::SchedulerBuilder`].
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if the configuration does not validate.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TriggerStore>,
        pool: Arc<dyn WorkerPool>,
        clock: Arc<dyn Clock>,
        listeners: Arc<BroadcastTriggerListener>,
    ) -> SchedulerResult<Self> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let instance_id = config.resolved_instance_id();
        let signals = Arc::new(SignalChannel::new(Arc::clone(&clock)));
        store.initialize(Arc::new(SchedulerSignalerImpl::new(
            Arc::clone(&signals),
            Arc::clone(&listeners),
        )));
        info!(
            instance = %config.instance_name,
            instance_id = %instance_id,
            workers = pool.worker_count(),
            "scheduler created"
        );
        Ok(Self {
            config,
            instance_id,
            store,
            pool,
            signals,
            listeners,
            clock,
            standby: Arc::new(AtomicBool::new(true)),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            dispatch: Mutex::new(None),
        })
    }

    fn ensure_running(&self) -> SchedulerResult<()> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }
        Ok(())
    }

    /// Start (or leave standby) and begin firing triggers.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`] after shutdown, [`SchedulerError::Pool`]
    /// if the dispatch thread cannot be spawned.
    pub fn start(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        let mut dispatch = self.dispatch.lock();
        if dispatch.is_none() {
            let dispatch_loop = DispatchLoop::new(
                LoopSettings::from_config(&self.config, self.instance_id.clone()),
                Arc::clone(&self.store),
                Arc::clone(&self.pool),
                Arc::clone(&self.signals),
                Arc::clone(&self.listeners),
                Arc::clone(&self.clock),
                Arc::clone(&self.standby),
            );
            let handle = dispatch_loop
                .spawn()
                .map_err(|e| {
                    SchedulerError::Pool(format!("failed to spawn dispatch thread: {e}"))
                })?;
            *dispatch = Some(handle);
        }
        self.standby.store(false, Ordering::Release);
        self.started.store(true, Ordering::Release);
        drop(dispatch);
        self.signals.signal(None);
        info!(instance = %self.config.instance_name, "scheduler started");
        Ok(())
    }

    /// Stop firing triggers until the next [`Self::start`].
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Shutdown`] after shutdown.
    pub fn standby(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.standby.store(true, Ordering::Release);
        self.signals.signal(None);
        info!(instance = %self.config.instance_name, "scheduler in standby");
        Ok(())
    }

    /// Whether [`Self::start`] has been called and shutdown has not.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_shutdown()
    }

    /// Whether the scheduler is not firing triggers.
    #[must_use]
    pub fn is_in_standby(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    /// Whether shutdown has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the dispatch loop and the worker pool. With `wait_for_jobs` the
    /// call returns after running jobs finish.
    pub fn shutdown(&self, wait_for_jobs: bool) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(instance = %self.config.instance_name, wait_for_jobs, "scheduler shutting down");
        self.standby.store(true, Ordering::Release);
        self.signals.request_shutdown();

        if let Some(handle) = self.dispatch.lock().take() {
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
        self.pool.shutdown(wait_for_jobs);
        info!(instance = %self.config.instance_name, "scheduler shut down");
    }

    /// [`Self::shutdown`] using the configured `wait_for_jobs_on_shutdown`.
    pub fn shutdown_with_defaults(&self) {
        self.shutdown(self.config.wait_for_jobs_on_shutdown);
    }

    /// Store `job` with `trigger` and return the first fire time.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidTrigger`] if the trigger targets another job,
    /// [`SchedulerError::WillNeverFire`] if it has no fire time,
    /// [`SchedulerError::ObjectAlreadyExists`] for taken keys.
    pub fn schedule_job(
        &self,
        job: JobDetail,
        mut trigger: Trigger,
    ) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_running()?;
        if trigger.job_key() != job.key() {
            return Err(SchedulerError::InvalidTrigger(format!(
                "trigger {} is bound to {}, not {}",
                trigger.key(),
                trigger.job_key(),
                job.key()
            )));
        }
        let first = Self::first_fire_time(&mut trigger)?;
        debug!(
            job = %job.key(),
            trigger = %trigger.key(),
            first_fire_time = %first,
            "scheduling job"
        );
        self.store.store_job_and_trigger(job, trigger, false)?;
        Ok(first)
    }

    /// Store a trigger for an already stored job and return its first fire time.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::JobNotFound`], [`SchedulerError::WillNeverFire`] or
    /// [`SchedulerError::ObjectAlreadyExists`].
    pub fn schedule_trigger(&self, mut trigger: Trigger) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_running()?;
        let first = Self::first_fire_time(&mut trigger)?;
        self.store.store_trigger(trigger, false)?;
        Ok(first)
    }

    fn first_fire_time(trigger: &mut Trigger) -> SchedulerResult<DateTime<Utc>> {
        trigger
            .compute_first_fire_time()?
            .ok_or_else(|| SchedulerError::WillNeverFire(trigger.key().to_string()))
    }

    /// Store a job without a trigger; it must be durable.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NonDurableJob`] or [`SchedulerError::ObjectAlreadyExists`].
    pub fn add_job(&self, job: JobDetail, replace: bool) -> SchedulerResult<()> {
        self.ensure_running()?;
        if !job.is_durable() {
            return Err(SchedulerError::NonDurableJob(job.key().to_string()));
        }
        self.store.store_job(job, replace)
    }

    /// Remove a trigger. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn unschedule_job(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        self.ensure_running()?;
        self.store.remove_trigger(key)
    }

    /// Replace the trigger at `key` with `new_trigger`, bound to the same job.
    /// Returns the new first fire time, or `None` if `key` was not stored.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::WillNeverFire`] if the new trigger has no fire time.
    pub fn reschedule_job(
        &self,
        key: &TriggerKey,
        mut new_trigger: Trigger,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.ensure_running()?;
        let Some(old) = self.store.retrieve_trigger(key)? else {
            return Ok(None);
        };
        new_trigger.set_job_key(old.job_key().clone());
        let first = Self::first_fire_time(&mut new_trigger)?;
        if self.store.replace_trigger(key, new_trigger)? {
            Ok(Some(first))
        } else {
            Ok(None)
        }
    }

    /// Remove a job and its triggers. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn delete_job(&self, key: &JobKey) -> SchedulerResult<bool> {
        self.ensure_running()?;
        self.store.remove_job(key)
    }

    /// Fire a stored job now through a one-shot trigger carrying `data`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::JobNotFound`] for an unknown job.
    pub fn trigger_job(
        &self,
        key: &JobKey,
        data: Option<JobDataMap>,
    ) -> SchedulerResult<TriggerKey> {
        self.ensure_running()?;
        if self.store.retrieve_job(key)?.is_none() {
            return Err(SchedulerError::JobNotFound(key.to_string()));
        }
        let mut builder = TriggerBuilder::new()
            .with_identity(Uuid::new_v4().to_string(), MANUAL_TRIGGER_GROUP)
            .for_job(key.clone())
            .start_at(self.clock.now())
            .with_misfire_instruction(MisfireInstruction::FireNow);
        for (name, value) in data.unwrap_or_default() {
            builder = builder.using_data(name, value);
        }
        let mut trigger = builder.build()?;
        let trigger_key = trigger.key().clone();
        Self::first_fire_time(&mut trigger)?;
        self.store.store_trigger(trigger, false)?;
        Ok(trigger_key)
    }

    /// Pause a trigger.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn pause_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_trigger(key)
    }

    /// Resume a trigger.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn resume_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_trigger(key)
    }

    /// Pause every trigger of a job.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn pause_job(&self, key: &JobKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_job(key)
    }

    /// Resume every trigger of a job.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn resume_job(&self, key: &JobKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_job(key)
    }

    /// Pause everything, including triggers stored later.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn pause_all(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_all()
    }

    /// Resume everything.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn resume_all(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_all()
    }

    /// Current state of a trigger.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn trigger_state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        self.store.trigger_state(key)
    }

    /// Copy of a stored trigger.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn get_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.store.retrieve_trigger(key)
    }

    /// Copy of a stored job.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn get_job(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        self.store.retrieve_job(key)
    }

    /// Copies of a job's triggers.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn triggers_of_job(&self, key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        self.store.triggers_for_job(key)
    }

    /// The listener broadcaster.
    #[must_use]
    pub fn listeners(&self) -> Arc<BroadcastTriggerListener> {
        Arc::clone(&self.listeners)
    }

    /// Register a trigger listener.
    pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
        self.listeners.add_listener(listener);
    }

    /// Worker pool utilization.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Resolved instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Stop the loop without joining anything
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.signals.request_shutdown();
            self.pool.shutdown(false);
            debug!("scheduler dropped without explicit shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::SchedulerBuilder;
    use crate::core::job::JobBuilder;

    fn scheduler() -> Scheduler {
        SchedulerBuilder::new(SchedulerConfig {
            thread_count: 1,
            ..SchedulerConfig::default()
        })
        .build()
        .unwrap()
    }

    fn job(durable: bool) -> JobDetail {
        JobBuilder::from_fn(|_| Ok(()))
            .with_identity("j", "g")
            .store_durably(durable)
            .build()
    }

    #[test]
    fn test_never_firing_trigger_is_rejected() {
        let scheduler = scheduler();
        let job = job(false);
        let trigger = TriggerBuilder::new()
            .with_identity("t", "g")
            .for_job(job.key().clone())
            .start_at(Utc::now())
            .with_cron("0 0 0 1 1 * 2000")
            .unwrap()
            .build()
            .unwrap();

        let err = scheduler.schedule_job(job, trigger).unwrap_err();
        assert!(matches!(err, SchedulerError::WillNeverFire(_)));
        scheduler.shutdown(true);
    }

    #[test]
    fn test_trigger_must_target_scheduled_job() {
        let scheduler = scheduler();
        let trigger = TriggerBuilder::new()
            .for_job(JobKey::new("other", "g"))
            .build()
            .unwrap();

        let err = scheduler.schedule_job(job(false), trigger).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger(_)));
        scheduler.shutdown(true);
    }

    #[test]
    fn test_add_job_requires_durability() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.add_job(job(false), false).unwrap_err(),
            SchedulerError::NonDurableJob(_)
        ));
        scheduler.add_job(job(true), false).unwrap();
        assert!(scheduler.get_job(&JobKey::new("j", "g")).unwrap().is_some());
        scheduler.shutdown(true);
    }

    #[test]
    fn test_operations_fail_after_shutdown() {
        let scheduler = scheduler();
        scheduler.shutdown(true);
        scheduler.shutdown(true);

        assert!(matches!(scheduler.start().unwrap_err(), SchedulerError::Shutdown));
        assert!(matches!(
            scheduler.add_job(job(true), false).unwrap_err(),
            SchedulerError::Shutdown
        ));
    }

    #[test]
    fn test_reschedule_unknown_trigger_returns_none() {
        let scheduler = scheduler();
        let trigger = TriggerBuilder::new()
            .for_job(JobKey::new("j", "g"))
            .build()
            .unwrap();
        assert_eq!(
            scheduler
                .reschedule_job(&TriggerKey::new("missing", "g"), trigger)
                .unwrap(),
            None
        );
        scheduler.shutdown(true);
    }
}
