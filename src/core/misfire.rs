//! Misfire detection and recovery.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::trigger::{MisfireInstruction, Trigger};
use crate::core::SchedulerError;
use crate::util::clock::to_time_delta;

/// What applying the misfire policy did to a trigger.
#[derive(Debug)]
pub enum MisfireOutcome {
    /// The trigger is within the threshold; nothing changed.
    NotMisfired,
    /// The trigger has a new next fire time.
    Rescheduled,
    /// No occurrence remains; the trigger should complete.
    Completed,
    /// The schedule failed to compute a next time; the trigger should go to
    /// `Error`.
    Failed(SchedulerError),
}

impl MisfireOutcome {
    /// Whether listeners should hear about this misfire.
    #[must_use]
    pub const fn is_misfire(&self) -> bool {
        !matches!(self, Self::NotMisfired)
    }
}

/// Decides whether a trigger has misfired and applies its instruction.
#[derive(Debug, Clone, Copy)]
pub struct MisfireHandler {
    threshold: Duration,
}

impl MisfireHandler {
    /// Create a handler with the given threshold.
    #[must_use]
    pub const fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// The configured threshold.
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Whether `trigger` is more than the threshold past its next fire time.
    #[must_use]
    pub fn is_misfired(&self, trigger: &Trigger, now: DateTime<Utc>) -> bool {
        if trigger.misfire_instruction() == MisfireInstruction::IgnoreMisfires {
            return false;
        }
        trigger
            .next_fire_time()
            .is_some_and(|next| now - next > to_time_delta(self.threshold))
    }

    /// Apply the trigger's instruction if it has misfired.
    pub fn apply(&self, trigger: &mut Trigger, now: DateTime<Utc>) -> MisfireOutcome {
        if !self.is_misfired(trigger, now) {
            return MisfireOutcome::NotMisfired;
        }
        let before = trigger.next_fire_time();
        if let Err(e) = trigger.update_after_misfire(now) {
            return MisfireOutcome::Failed(e);
        }
        match trigger.next_fire_time() {
            None => MisfireOutcome::Completed,
            Some(next) => {
                debug_assert!(before.is_none_or(|before| next >= before));
                MisfireOutcome::Rescheduled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobKey;
    use crate::core::trigger::TriggerBuilder;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trigger(instruction: MisfireInstruction) -> Trigger {
        let mut trigger = TriggerBuilder::new()
            .for_job(JobKey::with_default_group("job"))
            .start_at(at(0))
            .with_interval(Duration::from_secs(10))
            .unwrap()
            .repeat_forever()
            .with_misfire_instruction(instruction)
            .build()
            .unwrap();
        trigger.compute_first_fire_time().unwrap();
        trigger
    }

    #[test]
    fn test_within_threshold_is_not_misfired() {
        let handler = MisfireHandler::new(Duration::from_secs(5));
        let mut t = trigger(MisfireInstruction::RescheduleNextWithExistingCount);

        assert!(matches!(handler.apply(&mut t, at(5)), MisfireOutcome::NotMisfired));
        assert_eq!(t.next_fire_time(), Some(at(0)));
    }

    #[test]
    fn test_ignore_misfires_never_misfires() {
        let handler = MisfireHandler::new(Duration::from_secs(5));
        let mut t = trigger(MisfireInstruction::IgnoreMisfires);

        assert!(!handler.is_misfired(&t, at(1_000)));
        assert!(matches!(handler.apply(&mut t, at(1_000)), MisfireOutcome::NotMisfired));
        assert_eq!(t.next_fire_time(), Some(at(0)));
    }

    #[test]
    fn test_reschedule_next_is_idempotent() {
        let handler = MisfireHandler::new(Duration::from_secs(5));
        let mut t = trigger(MisfireInstruction::RescheduleNextWithExistingCount);

        assert!(matches!(handler.apply(&mut t, at(63)), MisfireOutcome::Rescheduled));
        let first = t.next_fire_time();
        assert_eq!(first, Some(at(70)));

        // Same instant again: no longer misfired, nothing moves.
        assert!(matches!(handler.apply(&mut t, at(63)), MisfireOutcome::NotMisfired));
        assert_eq!(t.next_fire_time(), first);
    }

    #[test]
    fn test_past_end_completes() {
        let handler = MisfireHandler::new(Duration::from_secs(1));
        let mut t = TriggerBuilder::new()
            .for_job(JobKey::with_default_group("job"))
            .start_at(at(0))
            .end_at(at(30))
            .with_interval(Duration::from_secs(10))
            .unwrap()
            .repeat_forever()
            .with_misfire_instruction(MisfireInstruction::RescheduleNextWithExistingCount)
            .build()
            .unwrap();
        t.compute_first_fire_time().unwrap();

        assert!(matches!(handler.apply(&mut t, at(100)), MisfireOutcome::Completed));
        assert_eq!(t.next_fire_time(), None);
    }
}
