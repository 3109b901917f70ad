//! Jobs, fired-trigger bundles and the execution context handed to job bodies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::trigger::{Trigger, DEFAULT_GROUP};

/// Key/value data carried by jobs and triggers.
pub type JobDataMap = serde_json::Map<String, Value>;

/// Unique `(name, group)` identity of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Name within the group.
    pub name: String,
    /// Group name.
    pub group: String,
}

impl JobKey {
    /// Create a key in `group`.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    /// Create a key in the default group.
    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Failure reported by a job body, with instructions for the scheduler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    message: String,
    refire_immediately: bool,
    unschedule_firing_trigger: bool,
    unschedule_all_triggers: bool,
}

impl JobExecutionError {
    /// Plain failure; the trigger keeps its schedule.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    /// Ask for the job to run again right away.
    #[must_use]
    pub const fn with_refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    /// Ask for the firing trigger to be completed.
    #[must_use]
    pub const fn with_unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    /// Ask for every trigger of the job to be completed.
    #[must_use]
    pub const fn with_unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }

    /// Failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the job should run again immediately.
    #[must_use]
    pub const fn refire_immediately(&self) -> bool {
        self.refire_immediately
    }

    /// Whether the firing trigger should be completed.
    #[must_use]
    pub const fn unschedule_firing_trigger(&self) -> bool {
        self.unschedule_firing_trigger
    }

    /// Whether all the job's triggers should be completed.
    #[must_use]
    pub const fn unschedule_all_triggers(&self) -> bool {
        self.unschedule_all_triggers
    }
}

impl From<anyhow::Error> for JobExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Unit of work run when a trigger fires.
///
/// Runs on a worker thread inside that worker's tokio runtime.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Execute the job for one fire.
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
}

/// Adapter that turns a synchronous closure into a [`Job`].
pub struct FnJob<F>(F);

impl<F> FnJob<F>
where
    F: Fn(&mut JobExecutionContext) -> Result<(), JobExecutionError> + Send + Sync + 'static,
{
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: Fn(&mut JobExecutionContext) -> Result<(), JobExecutionError> + Send + Sync + 'static,
{
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        (self.0)(ctx)
    }
}

/// A registered job: identity, implementation, data and flags.
#[derive(Clone)]
pub struct JobDetail {
    key: JobKey,
    description: Option<String>,
    job: Arc<dyn Job>,
    data: JobDataMap,
    durable: bool,
    disallow_concurrent_execution: bool,
    persist_job_data_after_execution: bool,
}

impl fmt::Debug for JobDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDetail")
            .field("key", &self.key)
            .field("description", &self.description)
            .field("data", &self.data)
            .field("durable", &self.durable)
            .field(
                "disallow_concurrent_execution",
                &self.disallow_concurrent_execution,
            )
            .field(
                "persist_job_data_after_execution",
                &self.persist_job_data_after_execution,
            )
            .finish_non_exhaustive()
    }
}

impl JobDetail {
    /// Job identity.
    #[must_use]
    pub const fn key(&self) -> &JobKey {
        &self.key
    }

    /// Free-form description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The implementation.
    #[must_use]
    pub fn job(&self) -> Arc<dyn Job> {
        Arc::clone(&self.job)
    }

    /// Job-level data.
    #[must_use]
    pub const fn data(&self) -> &JobDataMap {
        &self.data
    }

    /// Whether the job stays stored without triggers.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether at most one execution may run at a time.
    #[must_use]
    pub const fn disallows_concurrent_execution(&self) -> bool {
        self.disallow_concurrent_execution
    }

    /// Whether the data map is written back after execution.
    #[must_use]
    pub const fn persists_job_data_after_execution(&self) -> bool {
        self.persist_job_data_after_execution
    }

    pub(crate) fn set_data(&mut self, data: JobDataMap) {
        self.data = data;
    }
}

/// Builder for [`JobDetail`].
pub struct JobBuilder {
    key: Option<JobKey>,
    description: Option<String>,
    job: Arc<dyn Job>,
    data: JobDataMap,
    durable: bool,
    disallow_concurrent_execution: bool,
    persist_job_data_after_execution: bool,
}

impl JobBuilder {
    /// Start building a job around `job`.
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self {
            key: None,
            description: None,
            job,
            data: JobDataMap::new(),
            durable: false,
            disallow_concurrent_execution: false,
            persist_job_data_after_execution: false,
        }
    }

    /// Start building a job from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut JobExecutionContext) -> Result<(), JobExecutionError> + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnJob::new(f)))
    }

    /// Set the job key.
    #[must_use]
    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(JobKey::new(name, group));
        self
    }

    /// Set the job key from an existing key.
    #[must_use]
    pub fn with_key(mut self, key: JobKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Set a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a data entry.
    #[must_use]
    pub fn using_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Keep the job stored when it has no triggers.
    #[must_use]
    pub const fn store_durably(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Allow at most one execution at a time.
    #[must_use]
    pub const fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.disallow_concurrent_execution = disallow;
        self
    }

    /// Write the data map back after each execution.
    #[must_use]
    pub const fn persist_job_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    /// Build the job. A missing key becomes a random name in the default group.
    #[must_use]
    pub fn build(self) -> JobDetail {
        JobDetail {
            key: self
                .key
                .unwrap_or_else(|| JobKey::with_default_group(Uuid::new_v4().to_string())),
            description: self.description,
            job: self.job,
            data: self.data,
            durable: self.durable,
            disallow_concurrent_execution: self.disallow_concurrent_execution,
            persist_job_data_after_execution: self.persist_job_data_after_execution,
        }
    }
}

/// Everything a worker needs to run one fire, produced by the store when a
/// fire is confirmed.
#[derive(Debug, Clone)]
pub struct FiredTriggerBundle {
    /// Trigger copy after `triggered()`.
    pub trigger: Trigger,
    /// Job copy at fire time.
    pub job: JobDetail,
    /// Actual time the fire was confirmed.
    pub fire_time: DateTime<Utc>,
    /// Time the trigger was scheduled to fire.
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    /// Previous scheduled fire.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Next scheduled fire after this one.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Whether this fire recovers an interrupted execution.
    pub recovering: bool,
    /// Unique id of this fire.
    pub fire_instance_id: String,
}

/// Result of an execution as seen by listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Not run yet.
    #[default]
    Pending,
    /// Ran without error.
    Succeeded,
    /// Ran and failed, or panicked.
    Failed(String),
    /// A listener vetoed the execution.
    Vetoed,
}

/// Per-fire context handed to jobs and listeners.
///
/// The `correlation` map travels with a fire from acquisition to completion;
/// the dispatch loop seeds it with the batch id and scheduler instance.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    /// Trigger that fired.
    pub trigger: Trigger,
    /// Job being executed.
    pub job: JobDetail,
    /// Job data overlaid with trigger data. Read-only view for the job body.
    pub merged_data: JobDataMap,
    /// The job's own data map. Written back to the store when the job
    /// persists its data; trigger data never lands here.
    pub job_data: JobDataMap,
    /// Actual fire time.
    pub fire_time: DateTime<Utc>,
    /// Scheduled fire time.
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    /// Previous scheduled fire.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Next scheduled fire.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Number of immediate re-executions so far.
    pub refire_count: u32,
    /// Whether the fire recovers an interrupted execution.
    pub recovering: bool,
    /// Unique id of this fire; empty until the fire is confirmed.
    pub fire_instance_id: String,
    /// Execution outcome.
    pub outcome: ExecutionOutcome,
    /// Value the job chose to publish.
    pub result: Option<Value>,
    /// Free-form correlation data.
    pub correlation: JobDataMap,
    /// Wall time spent in the job body.
    pub run_time: Option<Duration>,
}

fn merge_data(job: &JobDetail, trigger: &Trigger) -> JobDataMap {
    let mut merged = job.data().clone();
    for (key, value) in trigger.data() {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

impl JobExecutionContext {
    /// Context for an acquired trigger whose fire is not yet confirmed.
    #[must_use]
    pub fn for_acquired(trigger: Trigger, job: JobDetail, now: DateTime<Utc>) -> Self {
        let merged_data = merge_data(&job, &trigger);
        Self {
            scheduled_fire_time: trigger.next_fire_time(),
            previous_fire_time: trigger.previous_fire_time(),
            next_fire_time: None,
            job_data: job.data().clone(),
            trigger,
            job,
            merged_data,
            fire_time: now,
            refire_count: 0,
            recovering: false,
            fire_instance_id: String::new(),
            outcome: ExecutionOutcome::Pending,
            result: None,
            correlation: JobDataMap::new(),
            run_time: None,
        }
    }

    /// Context for a confirmed fire.
    #[must_use]
    pub fn from_bundle(bundle: FiredTriggerBundle, correlation: JobDataMap) -> Self {
        let merged_data = merge_data(&bundle.job, &bundle.trigger);
        Self {
            job_data: bundle.job.data().clone(),
            trigger: bundle.trigger,
            job: bundle.job,
            merged_data,
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.next_fire_time,
            refire_count: 0,
            recovering: bundle.recovering,
            fire_instance_id: bundle.fire_instance_id,
            outcome: ExecutionOutcome::Pending,
            result: None,
            correlation,
            run_time: None,
        }
    }

    /// Job copy to report back to the store, carrying [`Self::job_data`]
    /// when the job persists its data.
    #[must_use]
    pub fn job_for_completion(&self) -> JobDetail {
        let mut job = self.job.clone();
        if job.persists_job_data_after_execution() {
            job.set_data(self.job_data.clone());
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trigger::TriggerBuilder;

    fn noop() -> JobBuilder {
        JobBuilder::from_fn(|_| Ok(()))
    }

    #[test]
    fn test_trigger_data_overrides_job_data() {
        let job = noop()
            .with_identity("job", "g")
            .using_data("a", 1)
            .using_data("b", "job")
            .build();
        let trigger = TriggerBuilder::new()
            .for_job(job.key().clone())
            .using_data("b", "trigger")
            .build()
            .unwrap();

        let ctx = JobExecutionContext::for_acquired(trigger, job, Utc::now());

        assert_eq!(ctx.merged_data["a"], 1);
        assert_eq!(ctx.merged_data["b"], "trigger");
        assert_eq!(ctx.outcome, ExecutionOutcome::Pending);
    }

    #[test]
    fn test_job_for_completion_persists_only_when_flagged() {
        let job = noop().using_data("count", 1).build();
        let trigger = TriggerBuilder::new().for_job(job.key().clone()).build().unwrap();
        let mut ctx = JobExecutionContext::for_acquired(trigger.clone(), job, Utc::now());
        ctx.job_data.insert("count".into(), 2.into());
        assert_eq!(ctx.job_for_completion().data()["count"], 1);

        let job = noop()
            .using_data("count", 1)
            .persist_job_data_after_execution(true)
            .build();
        let mut ctx = JobExecutionContext::for_acquired(trigger, job, Utc::now());
        ctx.job_data.insert("count".into(), 2.into());
        assert_eq!(ctx.job_for_completion().data()["count"], 2);
    }

    #[test]
    fn test_job_for_completion_keeps_trigger_data_out_of_job() {
        let job = noop()
            .using_data("count", 0)
            .persist_job_data_after_execution(true)
            .build();
        let trigger = TriggerBuilder::new()
            .for_job(job.key().clone())
            .using_data("trigger_only", 7)
            .build()
            .unwrap();
        let mut ctx = JobExecutionContext::for_acquired(trigger, job, Utc::now());
        assert_eq!(ctx.merged_data["trigger_only"], 7);
        ctx.job_data.insert("count".into(), 1.into());

        let persisted = ctx.job_for_completion();

        assert_eq!(persisted.data()["count"], 1);
        assert!(!persisted.data().contains_key("trigger_only"));
        assert_eq!(persisted.data().len(), 1);
    }

    #[test]
    fn test_execution_error_from_anyhow() {
        let err: JobExecutionError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.message(), "disk full");
        assert!(!err.refire_immediately());
    }

    #[tokio::test]
    async fn test_fn_job_executes_closure() {
        let job = JobBuilder::from_fn(|ctx| {
            ctx.result = Some("done".into());
            Ok(())
        })
        .build();
        let trigger = TriggerBuilder::new().for_job(job.key().clone()).build().unwrap();
        let mut ctx = JobExecutionContext::for_acquired(trigger, job.clone(), Utc::now());

        job.job().execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.result, Some(Value::from("done")));
    }
}
