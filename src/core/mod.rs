//! Core scheduling abstractions: triggers, jobs, the store contract, the
//! signal channel and the dispatch loop.

pub mod dispatch;
pub mod error;
pub mod job;
pub mod listener;
pub mod misfire;
pub mod run_shell;
pub mod schedule;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod trigger;
pub mod worker_pool;

pub use dispatch::{DispatchLoop, LoopSettings};
pub use error::{AppResult, SchedulerError, SchedulerResult};
pub use job::{
    ExecutionOutcome, FiredTriggerBundle, FnJob, Job, JobBuilder, JobDataMap, JobDetail,
    JobExecutionContext, JobExecutionError, JobKey,
};
pub use listener::{BroadcastTriggerListener, TriggerListener};
pub use misfire::{MisfireHandler, MisfireOutcome};
pub use run_shell::JobRunShell;
pub use schedule::{CronSchedule, IntervalSchedule, OnceSchedule, Schedule};
pub use scheduler::{Scheduler, SchedulerSignalerImpl};
pub use signal::{ScheduleCandidate, SignalChannel, SignalToken, WakeReason};
pub use store::{SchedulerSignaler, TriggerStore};
pub use trigger::{
    CompletedExecutionInstruction, MisfireInstruction, RepeatCount, Trigger, TriggerBuilder,
    TriggerKey, TriggerState,
};
pub use worker_pool::{PoolError, PoolStats, PoolTask, ThreadPool, WorkerPool};
