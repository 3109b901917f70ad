//! Tests for error types

use trigger_dispatch::core::{JobExecutionError, PoolError, SchedulerError};

#[test]
fn test_object_already_exists_error() {
    let err = SchedulerError::ObjectAlreadyExists("g.t".to_string());
    assert_eq!(format!("{}", err), "object already exists: g.t");
}

#[test]
fn test_will_never_fire_error() {
    let err = SchedulerError::WillNeverFire("g.t".to_string());
    assert_eq!(format!("{}", err), "trigger will never fire: g.t");
}

#[test]
fn test_shutdown_error() {
    assert_eq!(
        format!("{}", SchedulerError::Shutdown),
        "scheduler has been shut down"
    );
}

#[test]
fn test_pool_error_conversion() {
    assert!(matches!(
        SchedulerError::from(PoolError::PoolShutdown),
        SchedulerError::Shutdown
    ));
    assert!(matches!(
        SchedulerError::from(PoolError::InvalidConfig("x".into())),
        SchedulerError::InvalidConfig(_)
    ));
    assert!(matches!(
        SchedulerError::from(PoolError::QueueFull),
        SchedulerError::Pool(_)
    ));
}

#[test]
fn test_job_error_from_anyhow() {
    let err: JobExecutionError = anyhow::anyhow!("disk full").into();
    assert!(err.message().contains("disk full"));
    assert!(!err.refire_immediately());
    assert!(!err.unschedule_firing_trigger());
}
