//! Tests for the intercepting store decorator

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use trigger_dispatch::builders::SchedulerBuilder;
use trigger_dispatch::config::SchedulerConfig;
use trigger_dispatch::core::{
    JobBuilder, SchedulerResult, TriggerBuilder, TriggerKey, TriggerState, TriggerStore,
};
use trigger_dispatch::infra::store::{InterceptingStore, RamTriggerStore, StoreInterceptor, StoreOp};
use trigger_dispatch::util::SystemClock;

#[derive(Default)]
struct CountingInterceptor {
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl CountingInterceptor {
    fn count(&self, op: StoreOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }
}

impl StoreInterceptor for CountingInterceptor {
    fn before(&self, op: StoreOp) -> SchedulerResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        Ok(())
    }
}

#[test]
fn test_interceptor_sees_loop_calls() {
    let hook = Arc::new(CountingInterceptor::default());
    let store = Arc::new(InterceptingStore::new(
        RamTriggerStore::new(Arc::new(SystemClock), Duration::from_secs(60)),
        hook.clone(),
    ));
    let scheduler = SchedulerBuilder::new(SchedulerConfig {
        thread_count: 1,
        idle_wait_ms: 200,
        ..SchedulerConfig::default()
    })
    .with_store(store.clone())
    .build()
    .unwrap();

    let job = JobBuilder::from_fn(|_| Ok(())).with_identity("j", "g").build();
    let trigger = TriggerBuilder::new()
        .with_identity("t", "g")
        .for_job(job.key().clone())
        .start_at(Utc::now())
        .build()
        .unwrap();
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while hook.count(StoreOp::TriggeredJobComplete) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    scheduler.shutdown(true);

    assert!(hook.count(StoreOp::AcquireNextTriggers) >= 1);
    assert_eq!(hook.count(StoreOp::TriggersFired), 1);
    assert_eq!(hook.count(StoreOp::TriggeredJobComplete), 1);
    assert_eq!(
        store
            .inner()
            .trigger_state(&TriggerKey::new("t", "g"))
            .unwrap(),
        Some(TriggerState::Complete)
    );
}
