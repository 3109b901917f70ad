//! Trigger store contract.
//!
//! The store owns every trigger and job state transition. The dispatch loop
//! only ever sees copies and reports back through
//! [`TriggerStore::triggers_fired`] and [`TriggerStore::triggered_job_complete`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::job::{FiredTriggerBundle, JobDetail, JobKey};
use crate::core::trigger::{CompletedExecutionInstruction, Trigger, TriggerKey, TriggerState};
use crate::core::SchedulerResult;

/// Callbacks from the store back into the scheduler.
pub trait SchedulerSignaler: Send + Sync {
    /// Tell trigger listeners that `trigger` misfired.
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    /// Wake the dispatch loop; `candidate` is the affected next fire time when known.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
}

/// Repository of jobs and triggers with atomic acquisition.
pub trait TriggerStore: Send + Sync {
    /// Wire the signaler used for misfire notifications and scheduling changes.
    fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>);

    /// Claim up to `max_count` triggers due by `no_later_than + time_window`,
    /// ordered by next fire time, then priority (higher first), then key.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>>;

    /// Return an acquired trigger to `Waiting`. No-op for other states.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()>;

    /// Confirm firing of triggers that are still acquired. Triggers removed,
    /// paused or replaced since acquisition are left out of the result.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<FiredTriggerBundle>>;

    /// Record the end of an execution.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()>;

    /// Forward a scheduling change to the signaler.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);

    /// Store a job.
    ///
    /// # Errors
    ///
    /// [`crate::core::SchedulerError::ObjectAlreadyExists`] when the key is
    /// taken and `replace` is false.
    fn store_job(&self, job: JobDetail, replace: bool) -> SchedulerResult<()>;

    /// Store a trigger whose first fire time is already computed.
    ///
    /// # Errors
    ///
    /// [`crate::core::SchedulerError::JobNotFound`] for an unknown job,
    /// [`crate::core::SchedulerError::ObjectAlreadyExists`] for a taken key
    /// without `replace`.
    fn store_trigger(&self, trigger: Trigger, replace: bool) -> SchedulerResult<()>;

    /// Store a job and its trigger atomically.
    ///
    /// # Errors
    ///
    /// As [`Self::store_job`] and [`Self::store_trigger`]; nothing is stored on error.
    fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
        replace: bool,
    ) -> SchedulerResult<()>;

    /// Remove a job and all its triggers. Returns whether the job existed.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn remove_job(&self, key: &JobKey) -> SchedulerResult<bool>;

    /// Remove a trigger; a non-durable job left without triggers goes too.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn remove_trigger(&self, key: &TriggerKey) -> SchedulerResult<bool>;

    /// Replace a trigger with one bound to the same job.
    ///
    /// # Errors
    ///
    /// [`crate::core::SchedulerError::InvalidTrigger`] if the new trigger
    /// targets another job.
    fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> SchedulerResult<bool>;

    /// Copy of a stored job.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn retrieve_job(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>>;

    /// Copy of a stored trigger.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn retrieve_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>>;

    /// Current state of a trigger.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn trigger_state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>>;

    /// Copies of every trigger bound to a job.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn triggers_for_job(&self, key: &JobKey) -> SchedulerResult<Vec<Trigger>>;

    /// Pause a trigger.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn pause_trigger(&self, key: &TriggerKey) -> SchedulerResult<()>;

    /// Resume a trigger, applying misfire handling.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn resume_trigger(&self, key: &TriggerKey) -> SchedulerResult<()>;

    /// Pause every trigger of a job.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn pause_job(&self, key: &JobKey) -> SchedulerResult<()>;

    /// Resume every trigger of a job.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn resume_job(&self, key: &JobKey) -> SchedulerResult<()>;

    /// Pause every trigger, including ones stored later.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn pause_all(&self) -> SchedulerResult<()>;

    /// Undo [`Self::pause_all`] and resume every trigger.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn resume_all(&self) -> SchedulerResult<()>;

    /// Next fire time of the earliest waiting trigger.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn earliest_next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>>;

    /// Number of stored jobs.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn job_count(&self) -> SchedulerResult<usize>;

    /// Number of stored triggers.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn trigger_count(&self) -> SchedulerResult<usize>;

    /// Remove everything.
    ///
    /// # Errors
    ///
    /// Implementation-defined store failures.
    fn clear(&self) -> SchedulerResult<()>;
}
