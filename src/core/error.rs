//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job or trigger with the same key is already stored.
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),
    /// The referenced job is not stored.
    #[error("job not found: {0}")]
    JobNotFound(String),
    /// The referenced trigger is not stored.
    #[error("trigger not found: {0}")]
    TriggerNotFound(String),
    /// A job without triggers was added but is not durable.
    #[error("job {0} must be durable to be stored without a trigger")]
    NonDurableJob(String),
    /// The trigger's schedule never produces a fire time.
    #[error("trigger will never fire: {0}")]
    WillNeverFire(String),
    /// The trigger definition is incomplete or inconsistent.
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),
    /// The schedule definition could not be parsed or evaluated.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Trigger store failure with context.
    #[error("store error: {0}")]
    Store(String),
    /// Worker pool rejected or lost a task.
    #[error("worker pool error: {0}")]
    Pool(String),
    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    Shutdown,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Application-facing result using anyhow for listener and job bodies.
pub type AppResult<T> = Result<T, anyhow::Error>;
