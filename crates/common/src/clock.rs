//! Clock seam.
//!
//! Every time-dependent policy in the core (reconnect delay, chatstate
//! inactivity, MAM sync thresholds) reads time through [`Clock`] so that
//! tests can drive it by hand.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic time, used for timers and activity tracking.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for archive timestamps.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<(Instant, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new(start_utc: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new((Instant::now(), start_utc)),
        }
    }

    /// Move both clocks forward by `by`.
    pub fn advance(&self, by: Duration) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        guard.0 += by;
        if let Ok(delta) = chrono::Duration::from_std(by) {
            guard.1 += delta;
        }
    }

    /// Jump the wall clock without touching monotonic time.
    pub fn set_utc(&self, to: DateTime<Utc>) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.1 = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner
            .lock()
            .map(|g| g.0)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0)
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .map(|g| g.1)
            .unwrap_or_else(|poisoned| poisoned.into_inner().1)
    }
}

/// Convert unix seconds into a UTC timestamp.
pub fn from_unix_secs(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(Error::InvalidTimestamp(secs))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_clocks() {
        let start = from_unix_secs(1_700_000_000).unwrap();
        let clock = ManualClock::new(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now() - before, Duration::from_secs(90));
        assert_eq!(clock.now_utc().timestamp(), 1_700_000_090);
    }

    #[test]
    fn set_utc_keeps_monotonic_time() {
        let clock = ManualClock::new(from_unix_secs(0).unwrap());
        let before = clock.now();
        clock.set_utc(from_unix_secs(86_400).unwrap());
        assert_eq!(clock.now(), before);
        assert_eq!(clock.now_utc().timestamp(), 86_400);
    }

    #[test]
    fn out_of_range_timestamp_is_rejected() {
        assert!(from_unix_secs(i64::MAX).is_err());
    }
}
