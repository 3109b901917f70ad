//! Lost-wakeup regressions for the scheduling-change signal.
//!
//! A store that pauses right after acquisition widens the window between the
//! loop deciding how long to sleep and actually sleeping. A completion signal
//! landing there must still wake the loop, or a non-concurrent job misses
//! firings for a whole idle wait.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use trigger_dispatch::builders::SchedulerBuilder;
use trigger_dispatch::config::SchedulerConfig;
use trigger_dispatch::core::{
    JobBuilder, MisfireInstruction, SignalChannel, TriggerBuilder, WakeReason,
};
use trigger_dispatch::infra::store::{DelayInterceptor, InterceptingStore, RamTriggerStore, StoreOp};
use trigger_dispatch::util::{Clock, SystemClock};

/// Records the instant of every execution.
#[derive(Default)]
struct FireTimeCollector {
    fires: Mutex<Vec<Instant>>,
}

impl FireTimeCollector {
    fn record(&self) {
        self.fires.lock().push(Instant::now());
    }

    fn gaps(&self) -> Vec<Duration> {
        self.fires
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[test]
fn test_no_firing_is_missed_with_slow_acquisition() {
    let interval = Duration::from_millis(100);
    let idle_wait = Duration::from_secs(10);
    let misfire_threshold = Duration::from_millis(500);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let acquire_delay =
        DelayInterceptor::new().with_delay(StoreOp::AcquireNextTriggers, Duration::from_millis(10));
    let store = Arc::new(InterceptingStore::new(
        RamTriggerStore::new(Arc::clone(&clock), misfire_threshold),
        Arc::new(acquire_delay),
    ));
    let scheduler = SchedulerBuilder::new(SchedulerConfig {
        instance_name: "race".into(),
        thread_count: 2,
        idle_wait_ms: u64::try_from(idle_wait.as_millis()).unwrap(),
        misfire_threshold_ms: u64::try_from(misfire_threshold.as_millis()).unwrap(),
        ..SchedulerConfig::default()
    })
    .with_clock(clock)
    .with_store(store)
    .build()
    .unwrap();

    let collector = Arc::new(FireTimeCollector::default());
    let recorder = Arc::clone(&collector);
    let job = JobBuilder::from_fn(move |_| {
        recorder.record();
        Ok(())
    })
    .with_identity("job", "group")
    .disallow_concurrent_execution(true)
    .build();
    let trigger = TriggerBuilder::new()
        .with_identity("trigger1", "group1")
        .for_job(job.key().clone())
        .start_at(Utc::now() + chrono::TimeDelta::milliseconds(100))
        .with_interval(interval)
        .unwrap()
        .repeat_forever()
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfires)
        .build()
        .unwrap();

    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();
    thread::sleep(Duration::from_secs(3));
    scheduler.shutdown(true);

    let gaps = collector.gaps();
    assert!(gaps.len() >= 10, "job ran too rarely: {} gaps", gaps.len());
    for gap in &gaps {
        assert!(
            *gap < misfire_threshold * 4,
            "missed an execution, gap {gap:?} (all: {gaps:?})"
        );
    }
}

#[test]
fn test_signal_between_observe_and_wait_is_never_lost() {
    let channel = Arc::new(SignalChannel::new(Arc::new(SystemClock)));
    let mut rng = rand::rng();

    for _ in 0..200 {
        let token = channel.observe();
        let signaller = Arc::clone(&channel);
        let delay = Duration::from_micros(rng.random_range(0..500));
        let handle = thread::spawn(move || {
            thread::sleep(delay);
            signaller.signal(None);
        });
        // Let the signal land before, during or after entering the wait.
        thread::sleep(Duration::from_micros(rng.random_range(0..500)));

        let reason = channel.wait_for(token, Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(reason, WakeReason::Signaled);
    }
}

#[test]
fn test_many_signallers_each_wake_a_fresh_wait() {
    let channel = Arc::new(SignalChannel::new(Arc::new(SystemClock)));
    let rounds = 50;
    let waiter_channel = Arc::clone(&channel);
    let waiter = thread::spawn(move || {
        let mut woken = 0;
        let mut token = waiter_channel.observe();
        while woken < rounds {
            match waiter_channel.wait_for(token, Duration::from_secs(5)) {
                WakeReason::Signaled => {
                    woken += 1;
                    token = waiter_channel.observe();
                }
                other => return Err(other),
            }
        }
        Ok(woken)
    });

    let mut signallers = Vec::new();
    for _ in 0..4 {
        let channel = Arc::clone(&channel);
        signallers.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..rounds {
                thread::sleep(Duration::from_micros(rng.random_range(50..400)));
                channel.signal(Some(Utc::now()));
            }
        }));
    }
    for s in signallers {
        s.join().unwrap();
    }
    channel.request_shutdown();

    // Either all rounds were observed, or the remaining ones coalesced and the
    // waiter was released by shutdown instead of hanging.
    match waiter.join().unwrap() {
        Ok(woken) => assert_eq!(woken, rounds),
        Err(reason) => assert_eq!(reason, WakeReason::ShutdownRequested),
    }
}
