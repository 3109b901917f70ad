//! Recurrence rules.
//!
//! The dispatch core never looks inside a schedule; it only asks for the next
//! occurrence after a point in time. [`IntervalSchedule`], [`CronSchedule`] and
//! [`OnceSchedule`] cover the common cases; anything else can implement
//! [`Schedule`] directly.

use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::core::trigger::{MisfireInstruction, RepeatCount};
use crate::core::{SchedulerError, SchedulerResult};
use crate::util::clock::to_time_delta;

/// Upper bound on occurrences counted by the default [`Schedule::fires_between`].
pub const MAX_COUNTED_FIRES: u32 = 100_000;

/// A recurrence rule anchored at a trigger's start time.
pub trait Schedule: Send + Sync + Debug {
    /// First occurrence strictly after `after` for a trigger starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be evaluated at that point.
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>>;

    /// Number of occurrences in `(from, to]`.
    ///
    /// # Errors
    ///
    /// Propagates evaluation errors from [`Schedule::fire_time_after`].
    fn fires_between(
        &self,
        start: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<u32> {
        let mut count = 0;
        let mut cursor = from;
        while count < MAX_COUNTED_FIRES {
            match self.fire_time_after(start, cursor)? {
                Some(next) if next <= to => {
                    count += 1;
                    cursor = next;
                }
                _ => break,
            }
        }
        Ok(count)
    }

    /// Whether occurrences are laid out relative to the start time, so that
    /// moving the start time moves the cadence.
    fn anchored_to_start(&self) -> bool {
        true
    }

    /// Concrete instruction that [`MisfireInstruction::SmartPolicy`] resolves to.
    fn smart_misfire_instruction(&self, repeat: RepeatCount) -> MisfireInstruction {
        match repeat {
            RepeatCount::Times(0) => MisfireInstruction::FireNow,
            RepeatCount::Forever => MisfireInstruction::RescheduleNextWithRemainingCount,
            RepeatCount::Times(_) => MisfireInstruction::RescheduleNowWithExistingCount,
        }
    }
}

/// Fires exactly once, at the trigger's start time.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnceSchedule;

impl Schedule for OnceSchedule {
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        Ok((after < start).then_some(start))
    }
}

/// Fires at `start + k * interval` for `k = 0, 1, 2, ...`.
#[derive(Debug, Clone, Copy)]
pub struct IntervalSchedule {
    interval: TimeDelta,
}

impl IntervalSchedule {
    /// Create an interval schedule.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] for intervals under one millisecond.
    pub fn new(every: Duration) -> SchedulerResult<Self> {
        let interval = to_time_delta(every);
        if interval < TimeDelta::milliseconds(1) {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be at least 1ms".into(),
            ));
        }
        Ok(Self { interval })
    }

    /// The repeat interval.
    #[must_use]
    pub const fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// Occurrences at or before `t`.
    fn fires_up_to(&self, start: DateTime<Utc>, t: DateTime<Utc>) -> i64 {
        if t < start {
            return 0;
        }
        let elapsed = (t - start).num_milliseconds();
        elapsed / self.interval.num_milliseconds() + 1
    }
}

impl Schedule for IntervalSchedule {
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        if after < start {
            return Ok(Some(start));
        }
        let index = i32::try_from(self.fires_up_to(start, after))
            .map_err(|_| SchedulerError::InvalidSchedule("occurrence index overflow".into()))?;
        Ok(self
            .interval
            .checked_mul(index)
            .and_then(|offset| start.checked_add_signed(offset)))
    }

    fn fires_between(
        &self,
        start: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<u32> {
        let count = (self.fires_up_to(start, to) - self.fires_up_to(start, from)).max(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// Cron expression schedule (seconds-resolution, `cron` crate syntax).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression such as `"0/5 * * * * *"`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidSchedule`] if the expression does not parse.
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let schedule = cron::Schedule::from_str(expression)
            .map_err(|e| SchedulerError::InvalidSchedule(format!("`{expression}`: {e}")))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The source expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Schedule for CronSchedule {
    fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let floor = start - TimeDelta::milliseconds(1);
        let from = if after < floor { floor } else { after };
        Ok(self.schedule.after(&from).next())
    }

    fn anchored_to_start(&self) -> bool {
        false
    }

    fn smart_misfire_instruction(&self, _repeat: RepeatCount) -> MisfireInstruction {
        MisfireInstruction::FireNow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_interval_fire_time_after() {
        let schedule = IntervalSchedule::new(Duration::from_secs(10)).unwrap();
        let start = at(0);

        assert_eq!(schedule.fire_time_after(start, at(-5)).unwrap(), Some(at(0)));
        assert_eq!(schedule.fire_time_after(start, at(0)).unwrap(), Some(at(10)));
        assert_eq!(schedule.fire_time_after(start, at(15)).unwrap(), Some(at(20)));
        assert_eq!(schedule.fire_time_after(start, at(20)).unwrap(), Some(at(30)));
    }

    #[test]
    fn test_interval_fires_between() {
        let schedule = IntervalSchedule::new(Duration::from_secs(10)).unwrap();
        let start = at(0);

        // (10, 35] holds 20 and 30
        assert_eq!(schedule.fires_between(start, at(10), at(35)).unwrap(), 2);
        assert_eq!(schedule.fires_between(start, at(-1), at(0)).unwrap(), 1);
        assert_eq!(schedule.fires_between(start, at(35), at(10)).unwrap(), 0);
    }

    #[test]
    fn test_interval_rejects_zero() {
        assert!(matches!(
            IntervalSchedule::new(Duration::ZERO),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_once_schedule() {
        let start = at(0);
        assert_eq!(OnceSchedule.fire_time_after(start, at(-1)).unwrap(), Some(start));
        assert_eq!(OnceSchedule.fire_time_after(start, start).unwrap(), None);
        assert_eq!(OnceSchedule.fires_between(start, at(-10), at(10)).unwrap(), 1);
    }

    #[test]
    fn test_cron_schedule() {
        let schedule = CronSchedule::parse("0/5 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = schedule.fire_time_after(start, start - TimeDelta::seconds(30)).unwrap();
        assert_eq!(first, Some(start));

        let next = schedule.fire_time_after(start, start).unwrap();
        assert_eq!(next, Some(start + TimeDelta::seconds(5)));
        assert_eq!(
            schedule.smart_misfire_instruction(RepeatCount::Forever),
            MisfireInstruction::FireNow
        );
    }

    #[test]
    fn test_cron_rejects_garbage() {
        assert!(CronSchedule::parse("every tuesday").is_err());
    }
}
