//! Deadline tracking for a contribution attempt.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const SECONDS_PER_DAY: u64 = 86_400;
const SECONDS_PER_HOUR: u64 = 3_600;
const SECONDS_PER_MINUTE: u64 = 60;

///
/// A non-negative span of time split into calendar components.
///
/// Every field is derived with `/` and `%` from whole seconds, so `hours`
/// stays below 24 and `minutes` and `seconds` below 60 without clamping.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemainingTime {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl RemainingTime {
    pub fn from_millis(millis: u64) -> Self {
        let total_seconds = millis / 1000;

        Self {
            days: total_seconds / SECONDS_PER_DAY,
            hours: (total_seconds / SECONDS_PER_HOUR) % 24,
            minutes: (total_seconds / SECONDS_PER_MINUTE) % 60,
            seconds: total_seconds % 60,
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self::from_millis(duration.as_millis() as u64)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for RemainingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}d {:02}h {:02}m {:02}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Returns the time left until `deadline_millis`, or zero once it has passed.
pub fn remaining(deadline_millis: u64, now_millis: u64) -> RemainingTime {
    RemainingTime::from_millis(deadline_millis.saturating_sub(now_millis))
}

/// Returns `true` once `now_millis` has reached `deadline_millis`.
pub fn expired(deadline_millis: u64, now_millis: u64) -> bool {
    now_millis >= deadline_millis
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

///
/// Tracks the deadline of the current contribution attempt. A guard without
/// a deadline never expires.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutGuard {
    deadline: Option<u64>,
}

impl TimeoutGuard {
    pub fn new(deadline_millis: u64) -> Self {
        Self {
            deadline: Some(deadline_millis),
        }
    }

    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    /// Builds the guard for an attempt started at `started_at` that is granted `window` milliseconds.
    pub fn from_window(started_at: Option<u64>, window: Option<u64>) -> Self {
        match (started_at, window) {
            (Some(started_at), Some(window)) => Self::new(started_at.saturating_add(window)),
            _ => Self::unbounded(),
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn remaining_at(&self, now_millis: u64) -> Option<RemainingTime> {
        self.deadline.map(|deadline| remaining(deadline, now_millis))
    }

    pub fn expired_at(&self, now_millis: u64) -> bool {
        self.deadline
            .map(|deadline| expired(deadline, now_millis))
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at(now_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_decomposition() {
        let expected = RemainingTime {
            days: 1,
            hours: 1,
            minutes: 1,
            seconds: 1,
        };
        assert_eq!(expected, RemainingTime::from_millis(90_061_000));
        assert_eq!(RemainingTime::default(), RemainingTime::from_millis(0));
        assert!(RemainingTime::from_millis(999).is_zero());
    }

    #[test]
    fn test_decomposition_boundaries() {
        assert_eq!(
            RemainingTime {
                days: 0,
                hours: 23,
                minutes: 59,
                seconds: 59
            },
            RemainingTime::from_millis(SECONDS_PER_DAY * 1000 - 1)
        );
        assert_eq!(
            RemainingTime {
                days: 1,
                hours: 0,
                minutes: 0,
                seconds: 0
            },
            RemainingTime::from_millis(SECONDS_PER_DAY * 1000)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!("01d 01h 01m 01s", RemainingTime::from_millis(90_061_000).to_string());
        assert_eq!("00d 00h 02m 05s", RemainingTime::from_millis(125_000).to_string());
    }

    #[test]
    fn test_remaining_and_expired() {
        assert_eq!(RemainingTime::from_millis(5_000), remaining(10_000, 5_000));
        assert_eq!(RemainingTime::default(), remaining(5_000, 10_000));
        assert!(!expired(10_000, 9_999));
        assert!(expired(10_000, 10_000));
        assert!(expired(10_000, 10_001));
    }

    #[test]
    fn test_guard() {
        let guard = TimeoutGuard::from_window(Some(1_000), Some(60_000));
        assert_eq!(Some(61_000), guard.deadline());
        assert!(!guard.expired_at(60_999));
        assert!(guard.expired_at(61_000));
        assert_eq!(Some(RemainingTime::from_millis(1_000)), guard.remaining_at(60_000));

        let unbounded = TimeoutGuard::from_window(None, Some(60_000));
        assert!(!unbounded.expired_at(u64::MAX));
        assert_eq!(None, unbounded.remaining_at(0));
    }

    proptest! {
        // Each field stays within its natural range for every input, so a
        // clamp on the fields could never trigger.
        #[test]
        fn test_fields_within_range(millis in any::<u64>()) {
            let time = RemainingTime::from_millis(millis);
            prop_assert!(time.hours < 24);
            prop_assert!(time.minutes < 60);
            prop_assert!(time.seconds < 60);
        }

        #[test]
        fn test_fields_recompose(millis in 0..u64::MAX / 2) {
            let time = RemainingTime::from_millis(millis);
            let seconds = time.days * SECONDS_PER_DAY
                + time.hours * SECONDS_PER_HOUR
                + time.minutes * SECONDS_PER_MINUTE
                + time.seconds;
            prop_assert_eq!(millis / 1000, seconds);
        }
    }
}
