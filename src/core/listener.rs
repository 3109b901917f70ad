//! Trigger listeners and the broadcaster that fans events out to them.
//!
//! Veto checks run one listener at a time in registration order and stop at
//! the first veto. Every other event is delivered to all listeners at once:
//! the per-listener futures are joined, so the broadcast completes when the
//! slowest listener does. A listener that fails or panics is logged and
//! otherwise ignored.
//!
//! Broadcasts are futures. The dispatch loop and the workers drive them on
//! their own tokio runtimes; misfires found by the store are delivered on
//! the calling thread with [`futures::executor::block_on`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::core::job::JobExecutionContext;
use crate::core::trigger::{CompletedExecutionInstruction, Trigger};
use crate::core::AppResult;

/// Receives trigger lifecycle events. Every method has a no-op default.
#[async_trait]
pub trait TriggerListener: Send + Sync {
    /// Name used in logs and for removal.
    fn name(&self) -> &str;

    /// The trigger fired and its job is about to be considered for execution.
    ///
    /// # Errors
    ///
    /// Errors are logged by the broadcaster and never propagated.
    async fn trigger_fired(&self, _trigger: &Trigger, _ctx: &JobExecutionContext) -> AppResult<()> {
        Ok(())
    }

    /// Return `true` to stop the job from running for this fire.
    ///
    /// # Errors
    ///
    /// An error counts as "no veto".
    async fn veto_job_execution(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
    ) -> AppResult<bool> {
        Ok(false)
    }

    /// The trigger was found past its misfire threshold.
    ///
    /// # Errors
    ///
    /// Errors are logged by the broadcaster and never propagated.
    async fn trigger_misfired(&self, _trigger: &Trigger) -> AppResult<()> {
        Ok(())
    }

    /// The job finished (or was vetoed) for this fire.
    ///
    /// # Errors
    ///
    /// Errors are logged by the broadcaster and never propagated.
    async fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _ctx: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) -> AppResult<()> {
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}

fn report(event: &str, listener: &str, result: thread::Result<AppResult<()>>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(listener, event, error = %format!("{e:#}"), "trigger listener failed");
        }
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            error!(listener, event, panic = %panic, "trigger listener panicked");
        }
    }
}

/// Join one delivery per listener, containing failures and panics.
async fn join_reporting<'a>(
    event: &str,
    listeners: &[Arc<dyn TriggerListener>],
    deliveries: impl Iterator<Item = BoxFuture<'a, AppResult<()>>>,
) {
    let results = join_all(deliveries.map(|d| AssertUnwindSafe(d).catch_unwind())).await;
    for (listener, result) in listeners.iter().zip(results) {
        report(event, listener.name(), result);
    }
}

/// Ordered set of listeners treated as one.
pub struct BroadcastTriggerListener {
    name: String,
    listeners: RwLock<Vec<Arc<dyn TriggerListener>>>,
}

impl std::fmt::Debug for BroadcastTriggerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .listeners
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        f.debug_struct("BroadcastTriggerListener")
            .field("name", &self.name)
            .field("listeners", &names)
            .finish()
    }
}

impl BroadcastTriggerListener {
    /// Create an empty broadcaster.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Append a listener.
    pub fn add_listener(&self, listener: Arc<dyn TriggerListener>) {
        debug!(listener = listener.name(), "adding trigger listener");
        self.listeners.write().push(listener);
    }

    /// Remove this exact listener instance. Returns whether it was present.
    pub fn remove_listener(&self, listener: &Arc<dyn TriggerListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Remove the first listener registered under `name`. Returns whether one
    /// was present; later listeners sharing the name stay registered.
    pub fn remove_listener_by_name(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|l| l.name() == name) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the registered listeners in order.
    #[must_use]
    pub fn listeners(&self) -> Vec<Arc<dyn TriggerListener>> {
        self.listeners.read().clone()
    }

    /// Ask listeners in order whether to veto; stops at the first `true`.
    pub async fn broadcast_veto(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> bool {
        for listener in self.listeners() {
            let outcome = AssertUnwindSafe(listener.veto_job_execution(trigger, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(true)) => {
                    debug!(
                        listener = listener.name(),
                        trigger = %trigger.key(),
                        "execution vetoed"
                    );
                    return true;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => report("veto_job_execution", listener.name(), Ok(Err(e))),
                Err(payload) => report("veto_job_execution", listener.name(), Err(payload)),
            }
        }
        false
    }

    /// Deliver `trigger_fired` to every listener and wait for all.
    pub async fn broadcast_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) {
        let listeners = self.listeners();
        let deliveries = listeners.iter().map(|l| l.trigger_fired(trigger, ctx));
        join_reporting("trigger_fired", &listeners, deliveries).await;
    }

    /// Deliver `trigger_misfired` to every listener and wait for all.
    pub async fn broadcast_misfired(&self, trigger: &Trigger) {
        let listeners = self.listeners();
        let deliveries = listeners.iter().map(|l| l.trigger_misfired(trigger));
        join_reporting("trigger_misfired", &listeners, deliveries).await;
    }

    /// Deliver `trigger_complete` to every listener and wait for all.
    pub async fn broadcast_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        let listeners = self.listeners();
        let deliveries = listeners
            .iter()
            .map(|l| l.trigger_complete(trigger, ctx, instruction));
        join_reporting("trigger_complete", &listeners, deliveries).await;
    }
}

#[async_trait]
impl TriggerListener for BroadcastTriggerListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> AppResult<()> {
        self.broadcast_fired(trigger, ctx).await;
        Ok(())
    }

    async fn veto_job_execution(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
    ) -> AppResult<bool> {
        Ok(self.broadcast_veto(trigger, ctx).await)
    }

    async fn trigger_misfired(&self, trigger: &Trigger) -> AppResult<()> {
        self.broadcast_misfired(trigger).await;
        Ok(())
    }

    async fn trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) -> AppResult<()> {
        self.broadcast_complete(trigger, ctx, instruction).await;
        Ok(())
    }
}
