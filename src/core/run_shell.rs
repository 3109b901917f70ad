//! Runs one confirmed fire on a worker thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use crate::core::job::{ExecutionOutcome, FiredTriggerBundle, JobDataMap, JobExecutionContext};
use crate::core::listener::{panic_message, BroadcastTriggerListener};
use crate::core::store::TriggerStore;
use crate::core::trigger::CompletedExecutionInstruction;

/// Owns a fire from the moment it is handed to the pool until the store has
/// been told it finished.
pub struct JobRunShell {
    ctx: JobExecutionContext,
    store: Arc<dyn TriggerStore>,
    listeners: Arc<BroadcastTriggerListener>,
}

impl JobRunShell {
    /// Wrap a fired bundle.
    pub fn new(
        bundle: FiredTriggerBundle,
        correlation: JobDataMap,
        store: Arc<dyn TriggerStore>,
        listeners: Arc<BroadcastTriggerListener>,
    ) -> Self {
        Self {
            ctx: JobExecutionContext::from_bundle(bundle, correlation),
            store,
            listeners,
        }
    }

    /// The context the job will see.
    #[must_use]
    pub const fn context(&self) -> &JobExecutionContext {
        &self.ctx
    }

    /// Execute the job on `rt`, re-running it while it asks to be refired,
    /// then notify listeners and report completion to the store.
    pub fn run(mut self, rt: &Runtime) -> CompletedExecutionInstruction {
        let job = self.ctx.job.job();
        let instruction = loop {
            debug!(
                trigger = %self.ctx.trigger.key(),
                job = %self.ctx.job.key(),
                fire_instance_id = %self.ctx.fire_instance_id,
                refire_count = self.ctx.refire_count,
                "executing job"
            );
            let started = Instant::now();
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| rt.block_on(job.execute(&mut self.ctx))));
            self.ctx.run_time = Some(started.elapsed());

            let failure = match result {
                Ok(Ok(())) => {
                    self.ctx.outcome = ExecutionOutcome::Succeeded;
                    None
                }
                Ok(Err(e)) => {
                    warn!(job = %self.ctx.job.key(), error = %e, "job failed");
                    self.ctx.outcome = ExecutionOutcome::Failed(e.message().to_string());
                    Some(e)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(job = %self.ctx.job.key(), panic = %message, "job panicked");
                    self.ctx.outcome = ExecutionOutcome::Failed(format!("panicked: {message}"));
                    None
                }
            };

            match self.ctx.trigger.execution_complete(failure.as_ref()) {
                CompletedExecutionInstruction::ReExecuteJob => {
                    self.ctx.refire_count += 1;
                    debug!(
                        job = %self.ctx.job.key(),
                        refire_count = self.ctx.refire_count,
                        "re-executing job"
                    );
                }
                other => break other,
            }
        };

        rt.block_on(
            self.listeners
                .broadcast_complete(&self.ctx.trigger, &self.ctx, instruction),
        );
        let job = self.ctx.job_for_completion();
        if let Err(e) = self
            .store
            .triggered_job_complete(&self.ctx.trigger, &job, instruction)
        {
            error!(
                trigger = %self.ctx.trigger.key(),
                error = %e,
                "failed to record job completion"
            );
        }
        instruction
    }
}
