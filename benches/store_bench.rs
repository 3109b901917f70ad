//! Benchmarks for the in-memory trigger store and the signal channel.
//!
//! Benchmarks cover:
//! - Acquisition of due triggers from stores of increasing size
//! - A full acquire, fire and complete cycle
//! - Signalling with and without a candidate fire time

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use trigger_dispatch::core::{
    CompletedExecutionInstruction, JobBuilder, SignalChannel, TriggerBuilder, TriggerStore,
};
use trigger_dispatch::infra::store::RamTriggerStore;
use trigger_dispatch::util::{Clock, SystemClock};

// ============================================================================
// Fixtures
// ============================================================================

fn populated_store(triggers: u64) -> RamTriggerStore {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = RamTriggerStore::new(clock, Duration::from_secs(3600));
    let job = JobBuilder::from_fn(|_| Ok(()))
        .with_identity("bench", "bench")
        .store_durably(true)
        .build();
    let job_key = job.key().clone();
    store.store_job(job, false).unwrap();

    let base = Utc::now() - TimeDelta::seconds(1);
    for i in 0..triggers {
        let mut trigger = TriggerBuilder::new()
            .with_identity(format!("t{i}"), "bench")
            .for_job(job_key.clone())
            .start_at(base + TimeDelta::milliseconds(i64::try_from(i % 1_000).unwrap()))
            .with_interval(Duration::from_secs(3600))
            .unwrap()
            .repeat_forever()
            .build()
            .unwrap();
        trigger.compute_first_fire_time().unwrap();
        store.store_trigger(trigger, false).unwrap();
    }
    store
}

// ============================================================================
// Store Benchmarks
// ============================================================================

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_acquire_release");
    for size in [100_u64, 1_000, 10_000] {
        let store = populated_store(size);
        group.throughput(Throughput::Elements(10));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let acquired = store
                    .acquire_next_triggers(Utc::now(), 10, Duration::from_secs(5))
                    .unwrap();
                for trigger in &acquired {
                    store.release_acquired_trigger(trigger).unwrap();
                }
                black_box(acquired.len())
            });
        });
    }
    group.finish();
}

fn bench_fire_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_fire_cycle");
    for size in [100_u64, 1_000] {
        let store = populated_store(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let acquired = store
                    .acquire_next_triggers(Utc::now() + TimeDelta::hours(2), 1, Duration::ZERO)
                    .unwrap();
                let bundles = store.triggers_fired(&acquired).unwrap();
                for bundle in &bundles {
                    store
                        .triggered_job_complete(
                            &bundle.trigger,
                            &bundle.job,
                            CompletedExecutionInstruction::NoInstruction,
                        )
                        .unwrap();
                }
                black_box(bundles.len())
            });
        });
    }
    group.finish();
}

// ============================================================================
// Signal Benchmarks
// ============================================================================

fn bench_signal(c: &mut Criterion) {
    let channel = SignalChannel::new(Arc::new(SystemClock));
    let mut group = c.benchmark_group("signal_channel");
    group.bench_function("signal_unknown", |b| {
        b.iter(|| channel.signal(black_box(None)));
    });
    group.bench_function("signal_candidate", |b| {
        let at = Utc::now();
        b.iter(|| channel.signal(black_box(Some(at))));
    });
    group.bench_function("observe", |b| {
        b.iter(|| black_box(channel.observe()));
    });
    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_fire_cycle, bench_signal);
criterion_main!(benches);
