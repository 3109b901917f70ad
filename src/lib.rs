//! # Trigger Dispatch
//!
//! An in-process trigger scheduler for the Prometheus AI Platform.
//!
//! Jobs are units of work; triggers say when they run (once, at a fixed
//! interval, or on a cron expression). A single dispatch loop per scheduler
//! acquires due triggers from a [`core::TriggerStore`], waits until their fire
//! time, lets [`core::TriggerListener`]s veto them and hands confirmed fires
//! to a worker pool of dedicated OS threads.
//!
//! ## Core Problem Solved
//!
//! The loop sleeps between batches, and anything that changes the schedule
//! must be able to wake it. A change that lands between the loop computing
//! its sleep and actually sleeping must not be lost, or a newly added trigger
//! could be delayed by a full idle wait. [`core::SignalChannel`] closes that
//! window with a generation counter observed before the store is consulted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use trigger_dispatch::builders::SchedulerBuilder;
//! use trigger_dispatch::config::SchedulerConfig;
//! use trigger_dispatch::core::{JobBuilder, TriggerBuilder};
//!
//! # fn main() -> Result<(), trigger_dispatch::core::SchedulerError> {
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::default()).build()?;
//!
//! let job = JobBuilder::from_fn(|ctx| {
//!     tracing::info!(fire_time = %ctx.fire_time, "tick");
//!     Ok(())
//! })
//! .with_identity("heartbeat", "ops")
//! .build();
//!
//! let trigger = TriggerBuilder::new()
//!     .with_identity("every-second", "ops")
//!     .for_job(job.key().clone())
//!     .with_interval(Duration::from_secs(1))?
//!     .repeat_forever()
//!     .build()?;
//!
//! scheduler.schedule_job(job, trigger)?;
//! scheduler.start()?;
//! # scheduler.shutdown(true);
//! # Ok(())
//! # }
//! ```
//!
//! For complete scenarios, see `tests/scheduler_test.rs` and
//! `tests/signal_race_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: triggers, jobs, store, signals, dispatch.
pub mod core;
/// Configuration models for the scheduler and its worker pool.
pub mod config;
/// Builders to construct a scheduler from configuration.
pub mod builders;
/// Infrastructure adapters for trigger storage.
pub mod infra;
/// Shared utilities.
pub mod util;
