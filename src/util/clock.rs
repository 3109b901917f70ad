//! Time sources.
//!
//! Fire times, misfire checks and every sleep of the dispatch loop are
//! measured on a single injected [`Clock`], so tests can drive time with
//! [`ManualClock`] while the production path uses [`SystemClock`]. Sleeps
//! re-check the clock whenever it announces an advance. The worker pool's
//! availability poll is the one real-time bound; it only limits how long the
//! loop waits before re-checking shutdown.

use std::fmt::{self, Debug};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Callback run after a clock moves. Returns `false` once its owner is gone
/// so the clock can forget it.
pub type ClockWaker = Box<dyn Fn() -> bool + Send + Sync>;

/// Wall-clock plus monotonic time source.
pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time, used for fire times.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for signal timestamps and sleep
    /// deadlines.
    fn monotonic(&self) -> Instant;

    /// Register a callback for clocks that jump instead of flowing. Real
    /// clocks never jump, so the default drops it.
    fn on_advance(&self, _waker: ClockWaker) {}
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    origin: Instant,
    elapsed: Duration,
}

/// Clock that only moves when told to.
///
/// Both readings advance together, so the monotonic reading never goes
/// backward even if the wall time is reset. Every move runs the registered
/// wakers, which lets sleepers measured on this clock notice the jump.
pub struct ManualClock {
    state: Mutex<ManualState>,
    wakers: Mutex<Vec<ClockWaker>>,
}

impl Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("state", &*self.state.lock())
            .field("wakers", &self.wakers.lock().len())
            .finish()
    }
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                wall: start,
                origin: Instant::now(),
                elapsed: Duration::ZERO,
            }),
            wakers: Mutex::new(Vec::new()),
        }
    }

    /// Move both readings forward by `by`.
    pub fn advance(&self, by: Duration) {
        {
            let mut state = self.state.lock();
            state.wall += to_time_delta(by);
            state.elapsed += by;
        }
        self.wake();
    }

    /// Reset the wall-clock reading; the monotonic reading is untouched.
    pub fn set(&self, wall: DateTime<Utc>) {
        self.state.lock().wall = wall;
        self.wake();
    }

    fn wake(&self) {
        self.wakers.lock().retain(|waker| waker());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }

    fn monotonic(&self) -> Instant {
        let state = self.state.lock();
        state.origin + state.elapsed
    }

    fn on_advance(&self, waker: ClockWaker) {
        self.wakers.lock().push(waker);
    }
}

/// Convert a std duration into a chrono delta, saturating at a very large
/// value instead of failing.
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::weeks(52 * 1_000))
}

/// Convert a chrono delta into a std duration; negative deltas become zero.
pub fn to_std_duration(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        let mono = clock.monotonic();

        clock.advance(Duration::from_secs(5));

        assert_eq!(clock.now() - start, TimeDelta::seconds(5));
        assert_eq!(clock.monotonic() - mono, Duration::from_secs(5));
    }

    #[test]
    fn test_manual_clock_set_keeps_monotonic() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_millis(10));
        let mono = clock.monotonic();

        clock.set(start - TimeDelta::hours(1));

        assert_eq!(clock.now(), start - TimeDelta::hours(1));
        assert_eq!(clock.monotonic(), mono);
    }

    #[test]
    fn test_manual_clock_runs_wakers_and_drops_dead_ones() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let clock = ManualClock::new(Utc::now());
        let calls = Arc::new(AtomicUsize::new(0));
        let live = Arc::clone(&calls);
        clock.on_advance(Box::new(move || {
            live.fetch_add(1, Ordering::SeqCst);
            true
        }));
        clock.on_advance(Box::new(|| false));

        clock.advance(Duration::from_secs(1));
        clock.set(Utc::now());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(clock.wakers.lock().len(), 1);
    }

    #[test]
    fn test_negative_delta_clamps_to_zero() {
        assert_eq!(to_std_duration(TimeDelta::seconds(-3)), Duration::ZERO);
        assert_eq!(to_std_duration(TimeDelta::milliseconds(1500)), Duration::from_millis(1500));
    }
}
