//! Scheduling-change signal channel.
//!
//! The dispatch loop sleeps between batches; anything that changes the
//! schedule (a new trigger, a completed job, a resume) must be able to wake
//! it. The hazard is a signal landing after the loop decided how long to
//! sleep but before it actually sleeps. Here the loop first takes a
//! [`SignalToken`] with [`SignalChannel::observe`], then computes its wait,
//! then calls [`SignalChannel::wait_until`] with that token. Any signal after
//! the token bumps the generation, and the wait checks the generation under
//! the same lock the signal was written under, so nothing is lost.
//!
//! Deadlines are instants on the channel's [`Clock`]. A clock that jumps
//! wakes the channel through [`Clock::on_advance`], taking the channel lock
//! first, so a jump is seen by a waiter exactly like a signal is.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::util::clock::Clock;

/// Generation observed by the loop before it computes a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalToken {
    generation: u64,
}

impl SignalToken {
    /// Generation at the time of observation.
    #[must_use]
    pub const fn generation(self) -> u64 {
        self.generation
    }
}

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The deadline passed with no signal.
    TimedOut,
    /// A scheduling change was signalled after the token was taken.
    Signaled,
    /// Shutdown was requested.
    ShutdownRequested,
}

/// Earliest fire time announced by signals since the candidate was last taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleCandidate {
    /// Some signal did not say when; assume it is earlier than anything.
    Unknown,
    /// Earliest announced fire time.
    At(DateTime<Utc>),
}

impl ScheduleCandidate {
    fn merge(current: Option<Self>, incoming: Option<DateTime<Utc>>) -> Self {
        match (current, incoming) {
            (Some(Self::Unknown), _) | (_, None) => Self::Unknown,
            (Some(Self::At(a)), Some(b)) => Self::At(a.min(b)),
            (None, Some(b)) => Self::At(b),
        }
    }

    /// Whether this candidate is earlier than `time`.
    #[must_use]
    pub fn is_earlier_than(self, time: DateTime<Utc>) -> bool {
        match self {
            Self::Unknown => true,
            Self::At(at) => at < time,
        }
    }
}

#[derive(Debug)]
struct SignalState {
    generation: u64,
    signaled_at: Option<Instant>,
    candidate: Option<ScheduleCandidate>,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl Shared {
    fn notify(&self) {
        // Serialize with a waiter between its clock check and its park.
        drop(self.state.lock());
        self.wake.notify_all();
    }
}

/// Lock + condvar carrying scheduling-change signals to the dispatch loop.
#[derive(Debug)]
pub struct SignalChannel {
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
}

impl SignalChannel {
    /// Create a channel stamping signals and measuring waits with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SignalState {
                generation: 0,
                signaled_at: None,
                candidate: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let weak = Arc::downgrade(&shared);
        clock.on_advance(Box::new(move || match weak.upgrade() {
            Some(shared) => {
                shared.notify();
                true
            }
            None => false,
        }));
        Self { clock, shared }
    }

    /// Record a scheduling change and wake every waiter.
    ///
    /// `candidate` is the new trigger's next fire time when known.
    pub fn signal(&self, candidate: Option<DateTime<Utc>>) {
        let now = self.clock.monotonic();
        let mut state = self.shared.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.signaled_at = Some(state.signaled_at.map_or(now, |prev| prev.max(now)));
        state.candidate = Some(ScheduleCandidate::merge(state.candidate, candidate));
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Capture the current generation.
    #[must_use]
    pub fn observe(&self) -> SignalToken {
        SignalToken {
            generation: self.shared.state.lock().generation,
        }
    }

    /// Clear the candidate and capture the generation in one step, so the
    /// candidate afterwards only reflects signals newer than the token.
    #[must_use]
    pub fn observe_clearing_candidate(&self) -> SignalToken {
        let mut state = self.shared.state.lock();
        state.candidate = None;
        SignalToken {
            generation: state.generation,
        }
    }

    /// Block until a signal newer than `token`, shutdown, or until the
    /// clock's monotonic reading reaches `deadline`.
    pub fn wait_until(&self, token: SignalToken, deadline: Instant) -> WakeReason {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return WakeReason::ShutdownRequested;
            }
            if state.generation != token.generation {
                return WakeReason::Signaled;
            }
            let remaining = deadline.saturating_duration_since(self.clock.monotonic());
            if remaining.is_zero() {
                return WakeReason::TimedOut;
            }
            // Spurious, timed-out and clock wake-ups all fall through to the checks.
            let _ = self.shared.wake.wait_for(&mut state, remaining);
        }
    }

    /// [`Self::wait_until`] with a timeout measured on the clock.
    pub fn wait_for(&self, token: SignalToken, timeout: Duration) -> WakeReason {
        match self.clock.monotonic().checked_add(timeout) {
            Some(deadline) => self.wait_until(token, deadline),
            None => self.wait_forever(token),
        }
    }

    fn wait_forever(&self, token: SignalToken) -> WakeReason {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return WakeReason::ShutdownRequested;
            }
            if state.generation != token.generation {
                return WakeReason::Signaled;
            }
            self.shared.wake.wait(&mut state);
        }
    }

    /// Take and clear the accumulated candidate.
    pub fn take_candidate(&self) -> Option<ScheduleCandidate> {
        self.shared.state.lock().candidate.take()
    }

    /// Whether a pending signal announced a fire time earlier than `than`.
    #[must_use]
    pub fn is_candidate_earlier(&self, than: DateTime<Utc>) -> bool {
        self.shared
            .state
            .lock()
            .candidate
            .is_some_and(|candidate| candidate.is_earlier_than(than))
    }

    /// Set the shutdown flag and wake every waiter.
    pub fn request_shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Monotonic time of the latest signal.
    #[must_use]
    pub fn signaled_at(&self) -> Option<Instant> {
        self.shared.state.lock().signaled_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::{ManualClock, SystemClock};
    use std::thread;

    fn channel() -> Arc<SignalChannel> {
        Arc::new(SignalChannel::new(Arc::new(SystemClock)))
    }

    #[test]
    fn test_signal_before_wait_is_not_lost() {
        let channel = channel();
        let token = channel.observe();
        channel.signal(None);

        let started = Instant::now();
        let reason = channel.wait_for(token, Duration::from_secs(5));

        assert_eq!(reason, WakeReason::Signaled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out_without_signal() {
        let channel = channel();
        let token = channel.observe();
        assert_eq!(
            channel.wait_for(token, Duration::from_millis(20)),
            WakeReason::TimedOut
        );
    }

    #[test]
    fn test_signal_from_other_thread_wakes_waiter() {
        let channel = channel();
        let token = channel.observe();
        let signaller = Arc::clone(&channel);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal(None);
        });

        assert_eq!(
            channel.wait_for(token, Duration::from_secs(5)),
            WakeReason::Signaled
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_wins() {
        let channel = channel();
        let token = channel.observe();
        channel.signal(None);
        channel.request_shutdown();

        assert!(channel.is_shutdown());
        assert_eq!(
            channel.wait_for(token, Duration::from_secs(5)),
            WakeReason::ShutdownRequested
        );
    }

    #[test]
    fn test_candidate_keeps_earliest() {
        let channel = channel();
        let now = Utc::now();
        channel.signal(Some(now + chrono::TimeDelta::seconds(10)));
        channel.signal(Some(now + chrono::TimeDelta::seconds(5)));

        assert!(channel.is_candidate_earlier(now + chrono::TimeDelta::seconds(6)));
        assert!(!channel.is_candidate_earlier(now + chrono::TimeDelta::seconds(5)));
        assert_eq!(
            channel.take_candidate(),
            Some(ScheduleCandidate::At(now + chrono::TimeDelta::seconds(5)))
        );
        assert_eq!(channel.take_candidate(), None);

        channel.signal(Some(now));
        channel.signal(None);
        assert_eq!(channel.take_candidate(), Some(ScheduleCandidate::Unknown));
    }

    #[test]
    fn test_signaled_at_is_monotonic() {
        let channel = channel();
        assert_eq!(channel.signaled_at(), None);
        channel.signal(None);
        let first = channel.signaled_at().unwrap();
        channel.signal(None);
        assert!(channel.signaled_at().unwrap() >= first);
        assert_eq!(channel.generation(), 2);
    }

    #[test]
    fn test_wait_is_measured_on_the_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let channel = Arc::new(SignalChannel::new(clock.clone()));
        let token = channel.observe();
        let waiter = Arc::clone(&channel);
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_for(token, Duration::from_secs(3600)));

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        clock.advance(Duration::from_secs(1800));
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        clock.advance(Duration::from_secs(1800));

        assert_eq!(handle.join().unwrap(), WakeReason::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
