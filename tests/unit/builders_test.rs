//! Tests for builder modules

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use trigger_dispatch::builders::SchedulerBuilder;
use trigger_dispatch::config::{SchedulerConfig, WorkerPoolConfig};
use trigger_dispatch::core::{SchedulerError, ThreadPool, TriggerListener};
use trigger_dispatch::infra::RamTriggerStore;
use trigger_dispatch::util::{Clock, ManualClock};

struct Named;

#[async_trait]
impl TriggerListener for Named {
    fn name(&self) -> &str {
        "named"
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        instance_name: "builder-test".into(),
        thread_count: 1,
        ..SchedulerConfig::default()
    }
}

#[test]
fn test_scheduler_builder_defaults() {
    let scheduler = SchedulerBuilder::new(config()).build().unwrap();
    assert_eq!(scheduler.config().instance_name, "builder-test");
    assert_eq!(scheduler.pool_stats().worker_count, 1);
    assert!(scheduler.is_in_standby());
    scheduler.shutdown(true);
}

#[test]
fn test_scheduler_builder_overrides() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(RamTriggerStore::new(
        Arc::clone(&clock),
        std::time::Duration::from_secs(5),
    ));
    let pool = Arc::new(
        ThreadPool::new(WorkerPoolConfig::new().with_worker_count(3)).unwrap(),
    );

    let scheduler = SchedulerBuilder::new(config())
        .with_clock(clock)
        .with_store(store)
        .with_pool(pool)
        .with_listener(Arc::new(Named))
        .build()
        .unwrap();

    assert_eq!(scheduler.pool_stats().worker_count, 3);
    let names: Vec<String> = scheduler
        .listeners()
        .listeners()
        .iter()
        .map(|l| l.name().to_string())
        .collect();
    assert_eq!(names, vec!["named".to_string()]);
    scheduler.shutdown(true);
}

#[test]
fn test_scheduler_builder_invalid_config() {
    let cfg = SchedulerConfig {
        idle_wait_ms: 0,
        ..config()
    };
    assert!(matches!(
        SchedulerBuilder::new(cfg).build(),
        Err(SchedulerError::InvalidConfig(_))
    ));
}
