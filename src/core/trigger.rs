//! Trigger model: identity, state, misfire instructions and fire-time math.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::job::{JobDataMap, JobExecutionError, JobKey};
use crate::core::schedule::{CronSchedule, IntervalSchedule, OnceSchedule, Schedule};
use crate::core::{SchedulerError, SchedulerResult};

/// Group used when a key is created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Priority assigned to triggers that do not set one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Unique `(name, group)` identity of a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    /// Name within the group.
    pub name: String,
    /// Group name.
    pub group: String,
}

impl TriggerKey {
    /// Create a key in `group`.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Create a key in [`DEFAULT_GROUP`].
    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Lifecycle state of a stored trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Eligible for acquisition once due.
    Waiting,
    /// Claimed by the dispatch loop, not yet confirmed as fired.
    Acquired,
    /// Its job is running.
    Executing,
    /// Paused by a caller.
    Paused,
    /// Its non-concurrent job is running under another trigger.
    Blocked,
    /// Paused while blocked.
    PausedBlocked,
    /// No further fire time. Terminal.
    Complete,
    /// Failed beyond recovery. Terminal.
    Error,
}

impl TriggerState {
    /// Whether the state can no longer change except by removal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// What to do when a trigger is found too far past its fire time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfireInstruction {
    /// Defer to the schedule's default.
    #[default]
    SmartPolicy,
    /// Never treat the trigger as misfired; fire with the stale time.
    IgnoreMisfires,
    /// Fire immediately.
    FireNow,
    /// Skip to the next occurrence after now; repeat accounting unchanged.
    RescheduleNextWithExistingCount,
    /// Skip to the next occurrence after now; missed occurrences count as fired.
    RescheduleNextWithRemainingCount,
    /// Restart the cadence now keeping the full repeat count.
    RescheduleNowWithExistingCount,
    /// Restart the cadence now; missed occurrences are not repeated.
    RescheduleNowWithRemainingCount,
}

/// How many times a trigger repeats after its first fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    /// Repeat until the schedule or end time runs out.
    Forever,
    /// Repeat this many times after the first fire.
    Times(u32),
}

/// Instruction reported back to the store when an execution finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Nothing special; the trigger continues with its schedule.
    NoInstruction,
    /// Run the job again immediately with the same context.
    ReExecuteJob,
    /// Mark the firing trigger complete.
    SetTriggerComplete,
    /// Mark the firing trigger as errored.
    SetTriggerError,
    /// Mark every trigger of the job complete.
    SetAllJobTriggersComplete,
    /// Mark every trigger of the job as errored.
    SetAllJobTriggersError,
}

/// A firing rule bound to a job.
#[derive(Debug, Clone)]
pub struct Trigger {
    key: TriggerKey,
    job_key: JobKey,
    description: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    priority: i32,
    misfire_instruction: MisfireInstruction,
    repeat: RepeatCount,
    times_triggered: u32,
    schedule: Arc<dyn Schedule>,
    data: JobDataMap,
}

fn just_before(time: DateTime<Utc>) -> DateTime<Utc> {
    time - TimeDelta::milliseconds(1)
}

impl Trigger {
    /// Trigger identity.
    #[must_use]
    pub const fn key(&self) -> &TriggerKey {
        &self.key
    }

    /// Key of the job this trigger fires.
    #[must_use]
    pub const fn job_key(&self) -> &JobKey {
        &self.job_key
    }

    /// Free-form description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Anchor of the schedule.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// No fire happens after this time.
    #[must_use]
    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Next scheduled fire, `None` once exhausted.
    #[must_use]
    pub const fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    /// Most recent scheduled fire.
    #[must_use]
    pub const fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    /// Tie-breaker among triggers due at the same time; higher wins.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Configured misfire handling.
    #[must_use]
    pub const fn misfire_instruction(&self) -> MisfireInstruction {
        self.misfire_instruction
    }

    /// Remaining repeat budget.
    #[must_use]
    pub const fn repeat(&self) -> RepeatCount {
        self.repeat
    }

    /// Fires recorded since the last cadence restart.
    #[must_use]
    pub const fn times_triggered(&self) -> u32 {
        self.times_triggered
    }

    /// The recurrence rule.
    #[must_use]
    pub fn schedule(&self) -> &dyn Schedule {
        self.schedule.as_ref()
    }

    /// Trigger-level data, overlaid on the job's data at execution.
    #[must_use]
    pub const fn data(&self) -> &JobDataMap {
        &self.data
    }

    /// Whether another fire is scheduled.
    #[must_use]
    pub const fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    pub(crate) fn set_job_key(&mut self, job_key: JobKey) {
        self.job_key = job_key;
    }

    /// Compute and store the first fire time at or after the start time.
    ///
    /// # Errors
    ///
    /// Propagates schedule evaluation errors.
    pub fn compute_first_fire_time(&mut self) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.next_fire_time = self.fire_time_after(just_before(self.start_time))?;
        Ok(self.next_fire_time)
    }

    /// Next occurrence strictly after `after`, honoring end time and repeat count.
    ///
    /// # Errors
    ///
    /// Propagates schedule evaluation errors.
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        if let RepeatCount::Times(n) = self.repeat {
            if self.times_triggered > n {
                return Ok(None);
            }
        }
        let Some(candidate) = self.schedule.fire_time_after(self.start_time, after)? else {
            return Ok(None);
        };
        if self.end_time.is_some_and(|end| candidate > end) {
            return Ok(None);
        }
        if let RepeatCount::Times(n) = self.repeat {
            let index = self
                .schedule
                .fires_between(self.start_time, just_before(self.start_time), candidate)?;
            if index > n.saturating_add(1) {
                return Ok(None);
            }
        }
        Ok(Some(candidate))
    }

    /// Record a fire: shift next into previous and compute the new next.
    ///
    /// # Errors
    ///
    /// Propagates schedule evaluation errors; the trigger is left unchanged.
    pub fn triggered(&mut self) -> SchedulerResult<()> {
        let fired = self.next_fire_time;
        self.times_triggered = self.times_triggered.saturating_add(1);
        let next = match fired {
            Some(time) => self.fire_time_after(time),
            None => Ok(None),
        };
        match next {
            Ok(next) => {
                self.previous_fire_time = fired;
                self.next_fire_time = next;
                Ok(())
            }
            Err(e) => {
                self.times_triggered -= 1;
                Err(e)
            }
        }
    }

    /// Misfire instruction after resolving [`MisfireInstruction::SmartPolicy`].
    #[must_use]
    pub fn effective_misfire_instruction(&self) -> MisfireInstruction {
        match self.misfire_instruction {
            MisfireInstruction::SmartPolicy => self.schedule.smart_misfire_instruction(self.repeat),
            other => other,
        }
    }

    /// Apply the misfire instruction at `now`. The next fire time never moves
    /// backward; it becomes `None` when no occurrence remains.
    ///
    /// # Errors
    ///
    /// Propagates schedule evaluation errors.
    pub fn update_after_misfire(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        match self.effective_misfire_instruction() {
            MisfireInstruction::SmartPolicy | MisfireInstruction::IgnoreMisfires => {}
            MisfireInstruction::FireNow => {
                if matches!(self.repeat, RepeatCount::Times(0))
                    || !self.schedule.anchored_to_start()
                {
                    self.next_fire_time = self.bounded_by_end(now);
                } else {
                    self.reschedule_now(now, true)?;
                }
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                self.next_fire_time = self.fire_time_after(now)?;
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let missed_from = self.next_fire_time;
                let next = self.fire_time_after(now)?;
                if let (Some(missed_from), Some(_)) = (missed_from, next) {
                    let missed = self
                        .schedule
                        .fires_between(self.start_time, missed_from, now)?
                        .saturating_add(1);
                    self.times_triggered = self.times_triggered.saturating_add(missed);
                }
                self.next_fire_time = next;
            }
            MisfireInstruction::RescheduleNowWithExistingCount => self.reschedule_now(now, false)?,
            MisfireInstruction::RescheduleNowWithRemainingCount => self.reschedule_now(now, true)?,
        }
        Ok(())
    }

    fn reschedule_now(&mut self, now: DateTime<Utc>, drop_missed: bool) -> SchedulerResult<()> {
        let missed = match (drop_missed, self.next_fire_time) {
            (true, Some(from)) if from < now => {
                self.schedule.fires_between(self.start_time, from, now)?
            }
            _ => 0,
        };
        if let RepeatCount::Times(n) = self.repeat {
            if n != 0 {
                let used = self.times_triggered.saturating_add(missed);
                self.repeat = RepeatCount::Times(n.saturating_sub(used));
                self.times_triggered = 0;
            }
        }
        self.next_fire_time = self.bounded_by_end(now);
        if self.next_fire_time.is_some() {
            self.start_time = now;
        }
        Ok(())
    }

    fn bounded_by_end(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.end_time {
            Some(end) if time > end => None,
            _ => Some(time),
        }
    }

    /// Derive the completion instruction from an execution result.
    #[must_use]
    pub fn execution_complete(
        &self,
        error: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        match error {
            Some(e) if e.refire_immediately() => CompletedExecutionInstruction::ReExecuteJob,
            Some(e) if e.unschedule_firing_trigger() => {
                CompletedExecutionInstruction::SetTriggerComplete
            }
            Some(e) if e.unschedule_all_triggers() => {
                CompletedExecutionInstruction::SetAllJobTriggersComplete
            }
            _ => CompletedExecutionInstruction::NoInstruction,
        }
    }

    /// Acquisition order: earlier fire time, then higher priority, then key.
    #[must_use]
    pub fn fire_order(&self, other: &Self) -> Ordering {
        self.next_fire_time
            .cmp(&other.next_fire_time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Builder for [`Trigger`].
///
/// ```rust,ignore
/// let trigger = TriggerBuilder::new()
///     .with_identity("every-second", "heartbeat")
///     .for_job(JobKey::with_default_group("ping"))
///     .start_at(Utc::now())
///     .with_interval(Duration::from_secs(1))?
///     .repeat_forever()
///     .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct TriggerBuilder {
    key: Option<TriggerKey>,
    job_key: Option<JobKey>,
    description: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    priority: Option<i32>,
    misfire_instruction: MisfireInstruction,
    repeat: Option<RepeatCount>,
    schedule: Option<Arc<dyn Schedule>>,
    data: JobDataMap,
}

impl TriggerBuilder {
    /// Start a builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trigger key.
    #[must_use]
    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(TriggerKey::new(name, group));
        self
    }

    /// Set the trigger key from an existing key.
    #[must_use]
    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Bind the trigger to a job.
    #[must_use]
    pub fn for_job(mut self, job_key: JobKey) -> Self {
        self.job_key = Some(job_key);
        self
    }

    /// Set a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Anchor the schedule at `start`.
    #[must_use]
    pub const fn start_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Stop firing after `end`.
    #[must_use]
    pub const fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the misfire instruction.
    #[must_use]
    pub const fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    /// Use a custom schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Fire every `every`, starting at the start time.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] for a zero interval.
    pub fn with_interval(mut self, every: Duration) -> SchedulerResult<Self> {
        self.schedule = Some(Arc::new(IntervalSchedule::new(every)?));
        Ok(self)
    }

    /// Fire per a cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] if the expression does not parse.
    pub fn with_cron(mut self, expression: &str) -> SchedulerResult<Self> {
        self.schedule = Some(Arc::new(CronSchedule::parse(expression)?));
        self.repeat = Some(RepeatCount::Forever);
        Ok(self)
    }

    /// Repeat `n` times after the first fire.
    #[must_use]
    pub const fn with_repeat_count(mut self, n: u32) -> Self {
        self.repeat = Some(RepeatCount::Times(n));
        self
    }

    /// Repeat without limit.
    #[must_use]
    pub const fn repeat_forever(mut self) -> Self {
        self.repeat = Some(RepeatCount::Forever);
        self
    }

    /// Add a trigger-level data entry.
    #[must_use]
    pub fn using_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Build the trigger. The next fire time is left unset until the trigger
    /// is scheduled (see [`Trigger::compute_first_fire_time`]).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTrigger`] if no job is bound or the
    /// end time precedes the start time.
    pub fn build(self) -> SchedulerResult<Trigger> {
        let job_key = self.job_key.ok_or_else(|| {
            SchedulerError::InvalidTrigger("trigger must be bound to a job".into())
        })?;
        let key = self
            .key
            .unwrap_or_else(|| TriggerKey::with_default_group(Uuid::new_v4().to_string()));
        let start_time = self.start_time.unwrap_or_else(Utc::now);
        if let Some(end) = self.end_time {
            if end < start_time {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "trigger {key} ends before it starts"
                )));
            }
        }
        let schedule = self.schedule.unwrap_or_else(|| Arc::new(OnceSchedule));
        let repeat = self.repeat.unwrap_or(RepeatCount::Times(0));
        Ok(Trigger {
            key,
            job_key,
            description: self.description,
            start_time,
            end_time: self.end_time,
            next_fire_time: None,
            previous_fire_time: None,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            misfire_instruction: self.misfire_instruction,
            repeat,
            times_triggered: 0,
            schedule,
            data: self.data,
        })
    }
}
