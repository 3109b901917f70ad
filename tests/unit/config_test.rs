//! Tests for configuration validation

use trigger_dispatch::config::{SchedulerConfig, WorkerPoolConfig};

#[test]
fn test_worker_pool_config_validation() {
    let valid = WorkerPoolConfig::new()
        .with_worker_count(4)
        .with_max_queue_depth(16)
        .with_thread_name_prefix("w");
    assert!(valid.validate().is_ok());
}

#[test]
fn test_worker_pool_config_invalid_workers() {
    assert!(WorkerPoolConfig::new().with_worker_count(0).validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_queue_depth() {
    assert!(WorkerPoolConfig::new().with_max_queue_depth(0).validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_stack() {
    assert!(WorkerPoolConfig::new()
        .with_thread_stack_size(1024)
        .validate()
        .is_err());
}

#[test]
fn test_scheduler_config_defaults() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_batch_size, 1);
    assert_eq!(cfg.idle_wait_ms, 30_000);
    assert_eq!(cfg.misfire_threshold_ms, 60_000);
    assert!(cfg.wait_for_jobs_on_shutdown);
}

#[test]
fn test_scheduler_config_from_json_fills_defaults() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{ "instance_name": "reports", "thread_count": 3, "max_batch_size": 8 }"#,
    )
    .unwrap();

    assert_eq!(cfg.instance_name, "reports");
    assert_eq!(cfg.resolved_thread_count(), 3);
    assert_eq!(cfg.max_batch_size, 8);
    assert_eq!(cfg.idle_wait_ms, SchedulerConfig::default().idle_wait_ms);

    let pool = cfg.worker_pool_config();
    assert_eq!(pool.worker_count, 3);
    assert_eq!(pool.thread_name_prefix, "reports-worker");
}

#[test]
fn test_scheduler_config_rejects_bad_json() {
    assert!(SchedulerConfig::from_json_str("{ not json").is_err());
    assert!(SchedulerConfig::from_json_str(r#"{ "max_batch_size": 0 }"#).is_err());
}

#[test]
fn test_auto_instance_id_resolves_to_uuid() {
    let cfg = SchedulerConfig::default();
    let id = cfg.resolved_instance_id();
    assert_ne!(id, cfg.instance_id);
    assert!(uuid::Uuid::parse_str(&id).is_ok());

    let fixed = SchedulerConfig {
        instance_id: "node-1".into(),
        ..SchedulerConfig::default()
    };
    assert_eq!(fixed.resolved_instance_id(), "node-1");
}

#[test]
fn test_zero_threads_means_cpu_count() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.resolved_thread_count(), num_cpus::get());
}
