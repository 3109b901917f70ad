//! In-memory trigger store.
//!
//! All state lives behind one `parking_lot::Mutex`. Waiting triggers are kept
//! in a `BTreeSet` ordered by (next fire time, priority desc, key) so
//! acquisition pops them in fire order.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::job::{FiredTriggerBundle, JobDetail, JobKey};
use crate::core::misfire::{MisfireHandler, MisfireOutcome};
use crate::core::store::{SchedulerSignaler, TriggerStore};
use crate::core::trigger::{CompletedExecutionInstruction, Trigger, TriggerKey, TriggerState};
use crate::core::{SchedulerError, SchedulerResult};
use crate::util::clock::{to_time_delta, Clock};

/// Entry in the waiting-trigger index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimeIndexEntry {
    next: DateTime<Utc>,
    priority: i32,
    key: TriggerKey,
}

impl TimeIndexEntry {
    fn of(trigger: &Trigger) -> Option<Self> {
        trigger.next_fire_time().map(|next| Self {
            next,
            priority: trigger.priority(),
            key: trigger.key().clone(),
        })
    }
}

impl PartialOrd for TimeIndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeIndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest first, then higher priority, then key for a stable order
        self.next
            .cmp(&other.next)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.key.cmp(&other.key))
    }
}

#[derive(Debug)]
struct TriggerRecord {
    trigger: Trigger,
    state: TriggerState,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    job_triggers: HashMap<JobKey, BTreeSet<TriggerKey>>,
    /// Exactly the `Waiting` triggers that have a next fire time.
    time_index: BTreeSet<TimeIndexEntry>,
    /// Non-concurrent jobs with an execution in flight.
    blocked_jobs: HashSet<JobKey>,
    paused_all: bool,
}

impl StoreState {
    fn initial_state(&self, trigger: &Trigger) -> TriggerState {
        let blocked = self.blocked_jobs.contains(trigger.job_key());
        match (self.paused_all, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) if trigger.next_fire_time().is_none() => TriggerState::Complete,
            (false, false) => TriggerState::Waiting,
        }
    }

    fn insert_trigger(&mut self, trigger: Trigger) {
        let state = self.initial_state(&trigger);
        let key = trigger.key().clone();
        self.job_triggers
            .entry(trigger.job_key().clone())
            .or_default()
            .insert(key.clone());
        if state == TriggerState::Waiting {
            if let Some(entry) = TimeIndexEntry::of(&trigger) {
                self.time_index.insert(entry);
            }
        }
        self.triggers.insert(key, TriggerRecord { trigger, state });
    }

    fn take_trigger(&mut self, key: &TriggerKey) -> Option<TriggerRecord> {
        let record = self.triggers.remove(key)?;
        if record.state == TriggerState::Waiting {
            if let Some(entry) = TimeIndexEntry::of(&record.trigger) {
                self.time_index.remove(&entry);
            }
        }
        if let Some(keys) = self.job_triggers.get_mut(record.trigger.job_key()) {
            keys.remove(key);
            if keys.is_empty() {
                self.job_triggers.remove(record.trigger.job_key());
            }
        }
        Some(record)
    }

    /// Move a trigger to `new_state`, keeping the time index in step. A
    /// trigger moved to `Waiting` without a next fire time completes instead.
    fn set_state(&mut self, key: &TriggerKey, new_state: TriggerState) {
        let Some(record) = self.triggers.get_mut(key) else {
            return;
        };
        if record.state == TriggerState::Waiting {
            if let Some(entry) = TimeIndexEntry::of(&record.trigger) {
                self.time_index.remove(&entry);
            }
        }
        record.state = new_state;
        if new_state == TriggerState::Waiting {
            match TimeIndexEntry::of(&record.trigger) {
                Some(entry) => {
                    self.time_index.insert(entry);
                }
                None => record.state = TriggerState::Complete,
            }
        }
    }

    fn state_of(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.triggers.get(key).map(|record| record.state)
    }

    fn trigger_keys_for(&self, job: &JobKey) -> Vec<TriggerKey> {
        self.job_triggers
            .get(job)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn pause_one(&mut self, key: &TriggerKey) {
        let next = match self.state_of(key) {
            Some(TriggerState::Blocked) => TriggerState::PausedBlocked,
            Some(
                TriggerState::Waiting | TriggerState::Acquired | TriggerState::Executing,
            ) => TriggerState::Paused,
            _ => return,
        };
        self.set_state(key, next);
    }

    fn resume_one(
        &mut self,
        key: &TriggerKey,
        now: DateTime<Utc>,
        misfire: &MisfireHandler,
        misfired: &mut Vec<Trigger>,
    ) {
        let Some(record) = self.triggers.get(key) else {
            return;
        };
        let current = record.state;
        let resumed = if self.blocked_jobs.contains(record.trigger.job_key()) {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };
        match current {
            TriggerState::Paused => {
                let failed = self.triggers.get_mut(key).and_then(|record| {
                    apply_misfire(misfire, &mut record.trigger, now, misfired)
                });
                self.set_state(key, failed.unwrap_or(resumed));
            }
            TriggerState::PausedBlocked => self.set_state(key, resumed),
            _ => {}
        }
    }

    fn unblock_job(&mut self, job: &JobKey) {
        if !self.blocked_jobs.remove(job) {
            return;
        }
        for key in self.trigger_keys_for(job) {
            match self.state_of(&key) {
                Some(TriggerState::Blocked) => self.set_state(&key, TriggerState::Waiting),
                Some(TriggerState::PausedBlocked) => self.set_state(&key, TriggerState::Paused),
                _ => {}
            }
        }
    }

    fn block_job(&mut self, job: &JobKey, firing: &TriggerKey) {
        self.blocked_jobs.insert(job.clone());
        for key in self.trigger_keys_for(job) {
            if &key == firing {
                continue;
            }
            match self.state_of(&key) {
                Some(TriggerState::Waiting | TriggerState::Acquired) => {
                    self.set_state(&key, TriggerState::Blocked);
                }
                Some(TriggerState::Paused) => self.set_state(&key, TriggerState::PausedBlocked),
                _ => {}
            }
        }
    }
}

/// Run misfire handling on a trigger that is not in the time index.
/// Returns the terminal state to move to, if any.
fn apply_misfire(
    misfire: &MisfireHandler,
    trigger: &mut Trigger,
    now: DateTime<Utc>,
    misfired: &mut Vec<Trigger>,
) -> Option<TriggerState> {
    if !misfire.is_misfired(trigger, now) {
        return None;
    }
    misfired.push(trigger.clone());
    match misfire.apply(trigger, now) {
        MisfireOutcome::NotMisfired | MisfireOutcome::Rescheduled => None,
        MisfireOutcome::Completed => Some(TriggerState::Complete),
        MisfireOutcome::Failed(e) => {
            error!(trigger = %trigger.key(), error = %e, "misfire handling failed");
            Some(TriggerState::Error)
        }
    }
}

/// Trigger store holding everything in process memory.
pub struct RamTriggerStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    misfire: MisfireHandler,
    signaler: RwLock<Option<Arc<dyn SchedulerSignaler>>>,
}

impl std::fmt::Debug for RamTriggerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamTriggerStore")
            .field("clock", &self.clock)
            .field("misfire", &self.misfire)
            .finish_non_exhaustive()
    }
}

impl RamTriggerStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>, misfire_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            misfire: MisfireHandler::new(misfire_threshold),
            signaler: RwLock::new(None),
        }
    }

    fn signaler(&self) -> Option<Arc<dyn SchedulerSignaler>> {
        self.signaler.read().clone()
    }

    fn notify_misfired(&self, misfired: &[Trigger]) {
        if misfired.is_empty() {
            return;
        }
        if let Some(signaler) = self.signaler() {
            for trigger in misfired {
                warn!(
                    trigger = %trigger.key(),
                    next_fire_time = ?trigger.next_fire_time(),
                    "trigger misfired"
                );
                signaler.notify_trigger_listeners_misfired(trigger);
            }
        }
    }

    fn signal(&self, candidate: Option<DateTime<Utc>>) {
        if let Some(signaler) = self.signaler() {
            signaler.signal_scheduling_change(candidate);
        }
    }

    fn check_store_trigger(
        state: &StoreState,
        trigger: &Trigger,
        replace: bool,
    ) -> SchedulerResult<()> {
        if !replace && state.triggers.contains_key(trigger.key()) {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "trigger {}",
                trigger.key()
            )));
        }
        Ok(())
    }
}

impl TriggerStore for RamTriggerStore {
    fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) {
        *self.signaler.write() = Some(signaler);
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let now = self.clock.now();
        let horizon = no_later_than + to_time_delta(time_window);
        let mut acquired = Vec::new();
        let mut misfired = Vec::new();
        let mut skipped = Vec::new();
        let mut acquired_jobs = HashSet::new();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        while acquired.len() < max_count {
            let Some(entry) = state.time_index.pop_first() else {
                break;
            };
            if entry.next > horizon {
                state.time_index.insert(entry);
                break;
            }
            let Some(record) = state.triggers.get_mut(&entry.key) else {
                continue;
            };

            if self.misfire.is_misfired(&record.trigger, now) {
                misfired.push(record.trigger.clone());
                match self.misfire.apply(&mut record.trigger, now) {
                    MisfireOutcome::NotMisfired => {}
                    MisfireOutcome::Rescheduled => {
                        // Back in the index at its new time; it may come up
                        // again in this same pass.
                        if let Some(entry) = TimeIndexEntry::of(&record.trigger) {
                            state.time_index.insert(entry);
                        }
                        continue;
                    }
                    MisfireOutcome::Completed => {
                        record.state = TriggerState::Complete;
                        continue;
                    }
                    MisfireOutcome::Failed(e) => {
                        error!(trigger = %entry.key, error = %e, "misfire handling failed");
                        record.state = TriggerState::Error;
                        continue;
                    }
                }
            }

            let job_key = record.trigger.job_key();
            let Some(job) = state.jobs.get(job_key) else {
                error!(trigger = %entry.key, job = %job_key, "trigger references a missing job");
                record.state = TriggerState::Error;
                continue;
            };
            if job.disallows_concurrent_execution() && !acquired_jobs.insert(job_key.clone()) {
                skipped.push(entry);
                continue;
            }

            record.state = TriggerState::Acquired;
            acquired.push(record.trigger.clone());
        }
        state.time_index.extend(skipped);
        drop(guard);

        self.notify_misfired(&misfired);
        debug!(count = acquired.len(), "acquired triggers");
        Ok(acquired)
    }

    fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        if state.state_of(trigger.key()) == Some(TriggerState::Acquired) {
            state.set_state(trigger.key(), TriggerState::Waiting);
        }
        Ok(())
    }

    fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<FiredTriggerBundle>> {
        let now = self.clock.now();
        let mut bundles = Vec::with_capacity(triggers.len());

        let mut guard = self.state.lock();
        let state = &mut *guard;
        for acquired in triggers {
            let key = acquired.key();
            let Some(record) = state.triggers.get_mut(key) else {
                debug!(trigger = %key, "trigger removed before firing");
                continue;
            };
            if record.state != TriggerState::Acquired {
                debug!(trigger = %key, state = ?record.state, "trigger no longer acquired");
                continue;
            }
            let Some(job) = state.jobs.get(record.trigger.job_key()).cloned() else {
                record.state = TriggerState::Error;
                continue;
            };

            let scheduled_fire_time = record.trigger.next_fire_time();
            let previous_fire_time = record.trigger.previous_fire_time();
            if let Err(e) = record.trigger.triggered() {
                error!(trigger = %key, error = %e, "failed to compute next fire time");
                record.state = TriggerState::Error;
                continue;
            }
            let trigger = record.trigger.clone();

            if job.disallows_concurrent_execution() {
                state.set_state(key, TriggerState::Executing);
                state.block_job(job.key(), key);
            } else if trigger.may_fire_again() {
                state.set_state(key, TriggerState::Waiting);
            } else {
                state.set_state(key, TriggerState::Executing);
            }

            bundles.push(FiredTriggerBundle {
                next_fire_time: trigger.next_fire_time(),
                trigger,
                job,
                fire_time: now,
                scheduled_fire_time,
                previous_fire_time,
                recovering: false,
                fire_instance_id: Uuid::new_v4().to_string(),
            });
        }
        Ok(bundles)
    }

    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(stored) = state.jobs.get_mut(job.key()) {
            if job.persists_job_data_after_execution() {
                stored.set_data(job.data().clone());
            }
            if job.disallows_concurrent_execution() {
                state.unblock_job(job.key());
            }
        }

        let key = trigger.key();
        match instruction {
            CompletedExecutionInstruction::NoInstruction
            | CompletedExecutionInstruction::ReExecuteJob => {
                if state.state_of(key) == Some(TriggerState::Executing) {
                    state.set_state(key, TriggerState::Waiting);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                state.set_state(key, TriggerState::Complete);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %key, "trigger set to error state");
                state.set_state(key, TriggerState::Error);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for key in state.trigger_keys_for(job.key()) {
                    state.set_state(&key, TriggerState::Complete);
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                warn!(job = %job.key(), "all job triggers set to error state");
                for key in state.trigger_keys_for(job.key()) {
                    state.set_state(&key, TriggerState::Error);
                }
            }
        }
        drop(guard);

        self.signal(None);
        Ok(())
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal(candidate);
    }

    fn store_job(&self, job: JobDetail, replace: bool) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        if !replace && state.jobs.contains_key(job.key()) {
            return Err(SchedulerError::ObjectAlreadyExists(format!("job {}", job.key())));
        }
        state.jobs.insert(job.key().clone(), job);
        Ok(())
    }

    fn store_trigger(&self, trigger: Trigger, replace: bool) -> SchedulerResult<()> {
        let candidate = trigger.next_fire_time();
        {
            let mut state = self.state.lock();
            if !state.jobs.contains_key(trigger.job_key()) {
                return Err(SchedulerError::JobNotFound(trigger.job_key().to_string()));
            }
            Self::check_store_trigger(&state, &trigger, replace)?;
            state.take_trigger(trigger.key());
            state.insert_trigger(trigger);
        }
        self.signal(candidate);
        Ok(())
    }

    fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
        replace: bool,
    ) -> SchedulerResult<()> {
        if trigger.job_key() != job.key() {
            return Err(SchedulerError::InvalidTrigger(format!(
                "trigger {} is bound to {}, not {}",
                trigger.key(),
                trigger.job_key(),
                job.key()
            )));
        }
        let candidate = trigger.next_fire_time();
        {
            let mut state = self.state.lock();
            if !replace && state.jobs.contains_key(job.key()) {
                return Err(SchedulerError::ObjectAlreadyExists(format!("job {}", job.key())));
            }
            Self::check_store_trigger(&state, &trigger, replace)?;
            state.jobs.insert(job.key().clone(), job);
            state.take_trigger(trigger.key());
            state.insert_trigger(trigger);
        }
        self.signal(candidate);
        Ok(())
    }

    fn remove_job(&self, key: &JobKey) -> SchedulerResult<bool> {
        let existed = {
            let mut state = self.state.lock();
            for trigger_key in state.trigger_keys_for(key) {
                state.take_trigger(&trigger_key);
            }
            state.blocked_jobs.remove(key);
            state.jobs.remove(key).is_some()
        };
        if existed {
            self.signal(None);
        }
        Ok(existed)
    }

    fn remove_trigger(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        let removed = {
            let mut state = self.state.lock();
            let Some(record) = state.take_trigger(key) else {
                return Ok(false);
            };
            let job_key = record.trigger.job_key();
            let orphaned = !state.job_triggers.contains_key(job_key)
                && state.jobs.get(job_key).is_some_and(|job| !job.is_durable());
            if orphaned {
                debug!(job = %job_key, "removing non-durable job without triggers");
                state.jobs.remove(job_key);
                state.blocked_jobs.remove(job_key);
            }
            true
        };
        self.signal(None);
        Ok(removed)
    }

    fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> SchedulerResult<bool> {
        let candidate = new_trigger.next_fire_time();
        {
            let mut state = self.state.lock();
            let Some(old) = state.triggers.get(key) else {
                return Ok(false);
            };
            if old.trigger.job_key() != new_trigger.job_key() {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "replacement for {key} must target job {}",
                    old.trigger.job_key()
                )));
            }
            if new_trigger.key() != key && state.triggers.contains_key(new_trigger.key()) {
                return Err(SchedulerError::ObjectAlreadyExists(format!(
                    "trigger {}",
                    new_trigger.key()
                )));
            }
            state.take_trigger(key);
            state.insert_trigger(new_trigger);
        }
        self.signal(candidate);
        Ok(true)
    }

    fn retrieve_job(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        Ok(self.state.lock().jobs.get(key).cloned())
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        Ok(self
            .state
            .lock()
            .triggers
            .get(key)
            .map(|record| record.trigger.clone()))
    }

    fn trigger_state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        Ok(self.state.lock().state_of(key))
    }

    fn triggers_for_job(&self, key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        let state = self.state.lock();
        Ok(state
            .trigger_keys_for(key)
            .iter()
            .filter_map(|k| state.triggers.get(k).map(|record| record.trigger.clone()))
            .collect())
    }

    fn pause_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        self.state.lock().pause_one(key);
        self.signal(None);
        Ok(())
    }

    fn resume_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut misfired = Vec::new();
        self.state
            .lock()
            .resume_one(key, now, &self.misfire, &mut misfired);
        self.notify_misfired(&misfired);
        self.signal(None);
        Ok(())
    }

    fn pause_job(&self, key: &JobKey) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        for trigger_key in state.trigger_keys_for(key) {
            state.pause_one(&trigger_key);
        }
        drop(state);
        self.signal(None);
        Ok(())
    }

    fn resume_job(&self, key: &JobKey) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut misfired = Vec::new();
        {
            let mut state = self.state.lock();
            for trigger_key in state.trigger_keys_for(key) {
                state.resume_one(&trigger_key, now, &self.misfire, &mut misfired);
            }
        }
        self.notify_misfired(&misfired);
        self.signal(None);
        Ok(())
    }

    fn pause_all(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        state.paused_all = true;
        let keys: Vec<TriggerKey> = state.triggers.keys().cloned().collect();
        for key in keys {
            state.pause_one(&key);
        }
        drop(state);
        self.signal(None);
        Ok(())
    }

    fn resume_all(&self) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut misfired = Vec::new();
        {
            let mut state = self.state.lock();
            state.paused_all = false;
            let keys: Vec<TriggerKey> = state.triggers.keys().cloned().collect();
            for key in keys {
                state.resume_one(&key, now, &self.misfire, &mut misfired);
            }
        }
        self.notify_misfired(&misfired);
        self.signal(None);
        Ok(())
    }

    fn earliest_next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().time_index.first().map(|entry| entry.next))
    }

    fn job_count(&self) -> SchedulerResult<usize> {
        Ok(self.state.lock().jobs.len())
    }

    fn trigger_count(&self) -> SchedulerResult<usize> {
        Ok(self.state.lock().triggers.len())
    }

    fn clear(&self) -> SchedulerResult<()> {
        *self.state.lock() = StoreState::default();
        self.signal(None);
        Ok(())
    }
}
