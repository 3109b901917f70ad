//! The dispatch loop.
//!
//! One dedicated thread per scheduler. Each iteration waits for a free
//! worker, sleeps until the next trigger is close (waking early on any
//! scheduling change), acquires a batch, waits for the batch's fire time,
//! asks listeners for vetoes, confirms the fires with the store and hands
//! each one to the worker pool.
//!
//! Every sleep starts from a [`SignalToken`](crate::core::signal::SignalToken)
//! taken *before* the store was read, so a change that lands between the read
//! and the sleep still wakes the loop. Sleeps are measured on the injected
//! clock. Listener broadcasts run on a current-thread runtime the loop owns.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::core::job::{ExecutionOutcome, JobDataMap, JobExecutionContext};
use crate::core::listener::BroadcastTriggerListener;
use crate::core::run_shell::JobRunShell;
use crate::core::signal::{SignalChannel, WakeReason};
use crate::core::store::TriggerStore;
use crate::core::trigger::{CompletedExecutionInstruction, Trigger, TriggerKey};
use crate::core::worker_pool::WorkerPool;
use crate::util::clock::{to_std_duration, to_time_delta, Clock};

/// How long to wait for a free worker before re-checking shutdown.
const AVAILABILITY_POLL: Duration = Duration::from_millis(500);

/// How long to sleep per standby check when no signal arrives.
const STANDBY_POLL: Duration = Duration::from_secs(1);

/// Releasing a batch costs about this many milliseconds; a batch due
/// sooner than that is fired rather than released.
const RELEASE_COST_MS: i64 = 70;

/// Remaining time under which a batch is fired instead of waited for.
const FIRE_SLACK: Duration = Duration::from_millis(2);

/// Correlation key carrying the batch id.
pub const CORRELATION_BATCH_ID: &str = "batch_id";

/// Correlation key carrying the scheduler instance id.
pub const CORRELATION_INSTANCE: &str = "scheduler_instance";

/// Timing knobs of the loop, taken from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Thread name prefix.
    pub instance_name: String,
    /// Instance id placed in correlation data.
    pub instance_id: String,
    /// Longest idle sleep.
    pub idle_wait: Duration,
    /// Extra lookahead for a batch.
    pub batch_time_window: Duration,
    /// Most triggers per batch.
    pub max_batch_size: usize,
    /// Pause after a store failure.
    pub store_retry_backoff: Duration,
    /// Misfire threshold, used to age out veto bookkeeping.
    pub misfire_threshold: Duration,
}

impl LoopSettings {
    /// Settings from a validated configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig, instance_id: String) -> Self {
        Self {
            instance_name: config.instance_name.clone(),
            instance_id,
            idle_wait: config.idle_wait(),
            batch_time_window: config.batch_time_window(),
            max_batch_size: config.max_batch_size,
            store_retry_backoff: config.store_retry_backoff(),
            misfire_threshold: config.misfire_threshold(),
        }
    }
}

enum BatchWait {
    Fire,
    Abandon,
    Shutdown,
}

/// The scheduler's dispatch loop and the collaborators it drives.
pub struct DispatchLoop {
    settings: LoopSettings,
    store: Arc<dyn TriggerStore>,
    pool: Arc<dyn WorkerPool>,
    signals: Arc<SignalChannel>,
    listeners: Arc<BroadcastTriggerListener>,
    clock: Arc<dyn Clock>,
    standby: Arc<AtomicBool>,
}

impl DispatchLoop {
    /// Assemble a loop; nothing runs until [`Self::spawn`] or [`Self::run`].
    pub fn new(
        settings: LoopSettings,
        store: Arc<dyn TriggerStore>,
        pool: Arc<dyn WorkerPool>,
        signals: Arc<SignalChannel>,
        listeners: Arc<BroadcastTriggerListener>,
        clock: Arc<dyn Clock>,
        standby: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            store,
            pool,
            signals,
            listeners,
            clock,
            standby,
        }
    }

    /// Run the loop on a thread named `<instance>-dispatch`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the listener runtime cannot be built or the
    /// thread cannot be spawned.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        thread::Builder::new()
            .name(format!("{}-dispatch", self.settings.instance_name))
            .spawn(move || self.run(&rt))
    }

    /// Run the loop on the current thread until shutdown, driving listener
    /// broadcasts on `rt`.
    pub fn run(&self, rt: &Runtime) {
        info!(instance = %self.settings.instance_name, "dispatch loop started");
        let mut consecutive_failures: u32 = 0;
        let mut vetoed: HashMap<TriggerKey, DateTime<Utc>> = HashMap::new();

        loop {
            if self.signals.is_shutdown() {
                break;
            }
            if self.standby.load(Ordering::Acquire) {
                let token = self.signals.observe();
                if self.signals.wait_for(token, STANDBY_POLL) == WakeReason::ShutdownRequested {
                    break;
                }
                continue;
            }

            let available = self.pool.block_for_available(AVAILABILITY_POLL);
            if available == 0 {
                continue;
            }

            // Token first, then the store: a change after the peek bumps the
            // generation and cuts the sleep short.
            let token = self.signals.observe();
            let earliest = match self.store.earliest_next_fire_time() {
                Ok(earliest) => earliest,
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        consecutive_failures,
                        error = %e,
                        "store failure while peeking; backing off"
                    );
                    if self.backoff() {
                        break;
                    }
                    continue;
                }
            };
            let wait = self.idle_wait_for(self.clock.now(), earliest);
            if !wait.is_zero() {
                match self.signals.wait_for(token, wait) {
                    WakeReason::ShutdownRequested => break,
                    WakeReason::Signaled => continue,
                    WakeReason::TimedOut => {}
                }
                if self.standby.load(Ordering::Acquire) {
                    continue;
                }
            }

            let batch_token = self.signals.observe_clearing_candidate();
            let now = self.clock.now();
            let max_count = available.min(self.settings.max_batch_size);
            let triggers = match self.store.acquire_next_triggers(
                now + to_time_delta(self.settings.idle_wait),
                max_count,
                self.settings.batch_time_window,
            ) {
                Ok(triggers) => {
                    if consecutive_failures > 0 {
                        info!(consecutive_failures, "store recovered");
                    }
                    consecutive_failures = 0;
                    triggers
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        consecutive_failures,
                        error = %e,
                        "failed to acquire triggers; backing off"
                    );
                    if self.backoff() {
                        break;
                    }
                    continue;
                }
            };
            if triggers.is_empty() {
                continue;
            }
            if self.signals.is_shutdown() {
                self.release_all(&triggers);
                break;
            }

            match self.wait_for_batch(&triggers, batch_token) {
                BatchWait::Fire => {}
                BatchWait::Abandon => {
                    debug!(count = triggers.len(), "earlier trigger signalled; releasing batch");
                    self.release_all(&triggers);
                    continue;
                }
                BatchWait::Shutdown => {
                    self.release_all(&triggers);
                    break;
                }
            }

            self.fire_batch(rt, triggers, &mut vetoed);
        }
        info!(instance = %self.settings.instance_name, "dispatch loop stopped");
    }

    fn idle_wait_for(&self, now: DateTime<Utc>, earliest: Option<DateTime<Utc>>) -> Duration {
        earliest.map_or(self.settings.idle_wait, |at| {
            to_std_duration(at - now)
                .saturating_sub(self.settings.batch_time_window)
                .min(self.settings.idle_wait)
        })
    }

    /// Sleep for the retry backoff; only shutdown cuts it short. Returns
    /// whether shutdown was requested.
    fn backoff(&self) -> bool {
        let Some(deadline) = self
            .clock
            .monotonic()
            .checked_add(self.settings.store_retry_backoff)
        else {
            return self.signals.is_shutdown();
        };
        let mut token = self.signals.observe();
        loop {
            match self.signals.wait_until(token, deadline) {
                WakeReason::ShutdownRequested => return true,
                WakeReason::TimedOut => return false,
                WakeReason::Signaled => token = self.signals.observe(),
            }
        }
    }

    fn wait_for_batch(
        &self,
        triggers: &[Trigger],
        mut token: crate::core::signal::SignalToken,
    ) -> BatchWait {
        let Some(fire_at) = triggers.iter().filter_map(Trigger::next_fire_time).min() else {
            return BatchWait::Fire;
        };
        loop {
            let remaining = to_std_duration(fire_at - self.clock.now());
            if remaining <= FIRE_SLACK {
                return BatchWait::Fire;
            }
            match self.signals.wait_for(token, remaining) {
                WakeReason::TimedOut => {}
                WakeReason::ShutdownRequested => return BatchWait::Shutdown,
                WakeReason::Signaled => {
                    if self.is_candidate_earlier_within_reason(fire_at) {
                        return BatchWait::Abandon;
                    }
                    token = self.signals.observe();
                }
            }
        }
    }

    fn is_candidate_earlier_within_reason(&self, fire_at: DateTime<Utc>) -> bool {
        if !self.signals.is_candidate_earlier(fire_at) {
            return false;
        }
        fire_at - self.clock.now() > TimeDelta::milliseconds(RELEASE_COST_MS)
    }

    fn release_all(&self, triggers: &[Trigger]) {
        for trigger in triggers {
            if let Err(e) = self.store.release_acquired_trigger(trigger) {
                error!(trigger = %trigger.key(), error = %e, "failed to release trigger");
            }
        }
    }

    fn fire_batch(
        &self,
        rt: &Runtime,
        triggers: Vec<Trigger>,
        vetoed: &mut HashMap<TriggerKey, DateTime<Utc>>,
    ) {
        let now = self.clock.now();
        let batch_id = Uuid::new_v4().to_string();
        let mut correlation = JobDataMap::new();
        correlation.insert(CORRELATION_BATCH_ID.into(), Value::from(batch_id.as_str()));
        correlation.insert(
            CORRELATION_INSTANCE.into(),
            Value::from(self.settings.instance_id.as_str()),
        );

        let mut to_fire = Vec::with_capacity(triggers.len());
        let mut consumed = Vec::new();
        for trigger in triggers {
            // An occurrence already vetoed once is consumed without asking again.
            let already_vetoed = matches!(
                (vetoed.get(trigger.key()), trigger.next_fire_time()),
                (Some(at), Some(next)) if *at == next
            );
            if already_vetoed {
                vetoed.remove(trigger.key());
                consumed.push(trigger);
                continue;
            }
            let job = match self.store.retrieve_job(trigger.job_key()) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(trigger = %trigger.key(), "job vanished before firing");
                    self.release_all(std::slice::from_ref(&trigger));
                    continue;
                }
                Err(e) => {
                    error!(trigger = %trigger.key(), error = %e, "failed to load job");
                    self.release_all(std::slice::from_ref(&trigger));
                    continue;
                }
            };

            let mut ctx = JobExecutionContext::for_acquired(trigger.clone(), job, now);
            ctx.correlation.clone_from(&correlation);
            rt.block_on(self.listeners.broadcast_fired(&trigger, &ctx));
            if rt.block_on(self.listeners.broadcast_veto(&trigger, &ctx)) {
                info!(
                    trigger = %trigger.key(),
                    batch_id = %batch_id,
                    "execution vetoed; releasing trigger"
                );
                self.release_all(std::slice::from_ref(&trigger));
                if let Some(at) = trigger.next_fire_time() {
                    vetoed.insert(trigger.key().clone(), at);
                }
                ctx.outcome = ExecutionOutcome::Vetoed;
                rt.block_on(self.listeners.broadcast_complete(
                    &trigger,
                    &ctx,
                    CompletedExecutionInstruction::NoInstruction,
                ));
                continue;
            }
            to_fire.push(trigger);
        }

        self.consume_vetoed(&consumed);
        let horizon = now - to_time_delta(self.settings.misfire_threshold);
        vetoed.retain(|_, at| *at >= horizon);

        if to_fire.is_empty() {
            return;
        }
        let bundles = match self.store.triggers_fired(&to_fire) {
            Ok(bundles) => bundles,
            Err(e) => {
                error!(error = %e, "failed to confirm fired triggers; releasing batch");
                self.release_all(&to_fire);
                return;
            }
        };

        for bundle in bundles {
            let trigger = bundle.trigger.clone();
            let job = bundle.job.clone();
            debug!(
                trigger = %trigger.key(),
                job = %job.key(),
                fire_instance_id = %bundle.fire_instance_id,
                "submitting fire"
            );
            let shell = JobRunShell::new(
                bundle,
                correlation.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.listeners),
            );
            let submitted = self.pool.run(Box::new(move |rt: &Runtime| {
                shell.run(rt);
            }));
            if let Err(e) = submitted {
                error!(trigger = %trigger.key(), error = %e, "worker pool rejected fire");
                if let Err(e) = self.store.triggered_job_complete(
                    &trigger,
                    &job,
                    CompletedExecutionInstruction::SetAllJobTriggersError,
                ) {
                    error!(trigger = %trigger.key(), error = %e, "failed to record rejected fire");
                }
            }
        }
    }

    /// Move vetoed occurrences past their fire time without running the job.
    fn consume_vetoed(&self, triggers: &[Trigger]) {
        if triggers.is_empty() {
            return;
        }
        match self.store.triggers_fired(triggers) {
            Ok(bundles) => {
                for bundle in bundles {
                    debug!(trigger = %bundle.trigger.key(), "skipping vetoed occurrence");
                    if let Err(e) = self.store.triggered_job_complete(
                        &bundle.trigger,
                        &bundle.job,
                        CompletedExecutionInstruction::NoInstruction,
                    ) {
                        error!(
                            trigger = %bundle.trigger.key(),
                            error = %e,
                            "failed to skip vetoed occurrence"
                        );
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to skip vetoed occurrences");
                self.release_all(triggers);
            }
        }
    }
}
