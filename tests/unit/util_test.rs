//! Tests for utility functions

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use trigger_dispatch::util::{to_std_duration, to_time_delta, Clock, ManualClock, SystemClock};

#[test]
fn test_duration_conversions() {
    assert_eq!(to_time_delta(Duration::from_millis(250)), TimeDelta::milliseconds(250));
    assert_eq!(to_std_duration(TimeDelta::seconds(2)), Duration::from_secs(2));
    assert_eq!(to_std_duration(TimeDelta::seconds(-2)), Duration::ZERO);
}

#[test]
fn test_huge_duration_saturates() {
    assert!(to_time_delta(Duration::MAX) > TimeDelta::weeks(52));
}

#[test]
fn test_manual_clock_is_frozen() {
    let start = Utc::now();
    let clock = ManualClock::new(start);
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(clock.now(), start);
}

#[test]
fn test_system_clock_moves_forward() {
    let clock = SystemClock;
    let a = clock.monotonic();
    let b = clock.monotonic();
    assert!(b >= a);
}

#[test]
fn test_init_tracing_is_idempotent() {
    trigger_dispatch::util::init_tracing();
    trigger_dispatch::util::init_tracing();
}

#[test]
fn test_init_tracing_with_fallback_directive() {
    trigger_dispatch::util::init_tracing_with("trigger_dispatch::core::dispatch=debug");
    tracing::debug!("tracing initialized for tests");
}
