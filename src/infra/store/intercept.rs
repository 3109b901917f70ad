//! Store decorator that runs hooks around the calls the dispatch loop makes.
//!
//! Used to inject latency or failures between the loop and its store, e.g. to
//! widen the window between an acquisition and the loop's wait.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::core::job::{FiredTriggerBundle, JobDetail, JobKey};
use crate::core::store::{SchedulerSignaler, TriggerStore};
use crate::core::trigger::{CompletedExecutionInstruction, Trigger, TriggerKey, TriggerState};
use crate::core::SchedulerResult;

/// Store calls a [`StoreInterceptor`] sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`TriggerStore::acquire_next_triggers`].
    AcquireNextTriggers,
    /// [`TriggerStore::release_acquired_trigger`].
    ReleaseAcquiredTrigger,
    /// [`TriggerStore::triggers_fired`].
    TriggersFired,
    /// [`TriggerStore::triggered_job_complete`].
    TriggeredJobComplete,
    /// [`TriggerStore::signal_scheduling_change`].
    SignalSchedulingChange,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AcquireNextTriggers => "acquire_next_triggers",
            Self::ReleaseAcquiredTrigger => "release_acquired_trigger",
            Self::TriggersFired => "triggers_fired",
            Self::TriggeredJobComplete => "triggered_job_complete",
            Self::SignalSchedulingChange => "signal_scheduling_change",
        };
        f.write_str(name)
    }
}

/// Hook run before and after each intercepted call.
pub trait StoreInterceptor: Send + Sync {
    /// Runs before the call. An error is returned to the caller and the inner
    /// store is not touched. Ignored for [`StoreOp::SignalSchedulingChange`].
    ///
    /// # Errors
    ///
    /// Whatever the hook wants the caller to see.
    fn before(&self, op: StoreOp) -> SchedulerResult<()> {
        let _ = op;
        Ok(())
    }

    /// Runs after the inner call returned.
    fn after(&self, op: StoreOp) {
        let _ = op;
    }
}

/// Sleeps after selected operations return, before the caller sees the result.
#[derive(Debug, Default)]
pub struct DelayInterceptor {
    delays: Mutex<Vec<(StoreOp, Duration)>>,
}

impl DelayInterceptor {
    /// No delays.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep `delay` after every `op`.
    #[must_use]
    pub fn with_delay(self, op: StoreOp, delay: Duration) -> Self {
        self.set_delay(op, delay);
        self
    }

    /// Change the delay for `op` at runtime.
    pub fn set_delay(&self, op: StoreOp, delay: Duration) {
        let mut delays = self.delays.lock();
        delays.retain(|(existing, _)| *existing != op);
        delays.push((op, delay));
    }

    fn delay_for(&self, op: StoreOp) -> Option<Duration> {
        self.delays
            .lock()
            .iter()
            .find_map(|(existing, delay)| (*existing == op).then_some(*delay))
    }
}

impl StoreInterceptor for DelayInterceptor {
    fn after(&self, op: StoreOp) {
        if let Some(delay) = self.delay_for(op) {
            thread::sleep(delay);
        }
    }
}

/// Wraps a store and runs an interceptor around the loop-facing calls.
/// Management calls go straight through.
pub struct InterceptingStore<S> {
    inner: S,
    interceptor: Arc<dyn StoreInterceptor>,
}

impl<S: TriggerStore> InterceptingStore<S> {
    /// Decorate `inner`.
    pub fn new(inner: S, interceptor: Arc<dyn StoreInterceptor>) -> Self {
        Self { inner, interceptor }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    fn around<T>(
        &self,
        op: StoreOp,
        call: impl FnOnce() -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        self.interceptor.before(op)?;
        let result = call();
        self.interceptor.after(op);
        result
    }
}

impl<S: TriggerStore> TriggerStore for InterceptingStore<S> {
    fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) {
        self.inner.initialize(signaler);
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        self.around(StoreOp::AcquireNextTriggers, || {
            self.inner
                .acquire_next_triggers(no_later_than, max_count, time_window)
        })
    }

    fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        self.around(StoreOp::ReleaseAcquiredTrigger, || {
            self.inner.release_acquired_trigger(trigger)
        })
    }

    fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<FiredTriggerBundle>> {
        self.around(StoreOp::TriggersFired, || self.inner.triggers_fired(triggers))
    }

    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        self.around(StoreOp::TriggeredJobComplete, || {
            self.inner.triggered_job_complete(trigger, job, instruction)
        })
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        let _ = self.interceptor.before(StoreOp::SignalSchedulingChange);
        self.inner.signal_scheduling_change(candidate);
        self.interceptor.after(StoreOp::SignalSchedulingChange);
    }

    fn store_job(&self, job: JobDetail, replace: bool) -> SchedulerResult<()> {
        self.inner.store_job(job, replace)
    }

    fn store_trigger(&self, trigger: Trigger, replace: bool) -> SchedulerResult<()> {
        self.inner.store_trigger(trigger, replace)
    }

    fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
        replace: bool,
    ) -> SchedulerResult<()> {
        self.inner.store_job_and_trigger(job, trigger, replace)
    }

    fn remove_job(&self, key: &JobKey) -> SchedulerResult<bool> {
        self.inner.remove_job(key)
    }

    fn remove_trigger(&self, key: &TriggerKey) -> SchedulerResult<bool> {
        self.inner.remove_trigger(key)
    }

    fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> SchedulerResult<bool> {
        self.inner.replace_trigger(key, new_trigger)
    }

    fn retrieve_job(&self, key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        self.inner.retrieve_job(key)
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.inner.retrieve_trigger(key)
    }

    fn trigger_state(&self, key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        self.inner.trigger_state(key)
    }

    fn triggers_for_job(&self, key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        self.inner.triggers_for_job(key)
    }

    fn pause_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        self.inner.pause_trigger(key)
    }

    fn resume_trigger(&self, key: &TriggerKey) -> SchedulerResult<()> {
        self.inner.resume_trigger(key)
    }

    fn pause_job(&self, key: &JobKey) -> SchedulerResult<()> {
        self.inner.pause_job(key)
    }

    fn resume_job(&self, key: &JobKey) -> SchedulerResult<()> {
        self.inner.resume_job(key)
    }

    fn pause_all(&self) -> SchedulerResult<()> {
        self.inner.pause_all()
    }

    fn resume_all(&self) -> SchedulerResult<()> {
        self.inner.resume_all()
    }

    fn earliest_next_fire_time(&self) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.inner.earliest_next_fire_time()
    }

    fn job_count(&self) -> SchedulerResult<usize> {
        self.inner.job_count()
    }

    fn trigger_count(&self) -> SchedulerResult<usize> {
        self.inner.trigger_count()
    }

    fn clear(&self) -> SchedulerResult<()> {
        self.inner.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SchedulerError;
    use crate::infra::store::RamTriggerStore;
    use crate::util::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct FailAcquire {
        calls: AtomicUsize,
    }

    impl StoreInterceptor for FailAcquire {
        fn before(&self, op: StoreOp) -> SchedulerResult<()> {
            if op == StoreOp::AcquireNextTriggers {
                self.calls.fetch_add(1, Ordering::SeqCst);
                return Err(SchedulerError::Store("injected".into()));
            }
            Ok(())
        }
    }

    fn ram() -> RamTriggerStore {
        RamTriggerStore::new(Arc::new(SystemClock), Duration::from_secs(60))
    }

    #[test]
    fn test_before_error_short_circuits() {
        let hook = Arc::new(FailAcquire::default());
        let store = InterceptingStore::new(ram(), hook.clone());

        let err = store
            .acquire_next_triggers(Utc::now(), 1, Duration::ZERO)
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Store(_)));
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.trigger_count().unwrap(), 0);
    }

    #[test]
    fn test_delay_applies_to_selected_op() {
        let hook = Arc::new(
            DelayInterceptor::new()
                .with_delay(StoreOp::AcquireNextTriggers, Duration::from_millis(30)),
        );
        let store = InterceptingStore::new(ram(), hook);

        let started = Instant::now();
        store
            .acquire_next_triggers(Utc::now(), 1, Duration::ZERO)
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));

        let started = Instant::now();
        store.triggers_fired(&[]).unwrap();
        assert!(started.elapsed() < Duration::from_millis(30));
    }

    #[test]
    fn test_op_names() {
        assert_eq!(StoreOp::TriggersFired.to_string(), "triggers_fired");
    }
}
