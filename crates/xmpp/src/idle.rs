//! User idle detection feeding auto-away and auto-xa.

use std::{fmt, time::Duration};

use {gajim_config::IdleConfig, tracing::debug};

/// How often the runtime samples the idle source.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleState {
    #[default]
    Awake,
    Away,
    Xa,
}

impl IdleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Awake => "awake",
            Self::Away => "away",
            Self::Xa => "xa",
        }
    }

    pub fn is_awake(self) -> bool {
        self == Self::Awake
    }
}

impl fmt::Display for IdleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform hook reporting user inactivity.
pub trait IdleSource: Send {
    /// Time since the last user input, `None` if unknown.
    fn idle_time(&self) -> Option<Duration>;

    fn screensaver_active(&self) -> bool {
        false
    }
}

/// Classifies idle time and reports only transitions.
#[derive(Debug, Clone)]
pub struct IdleMonitor {
    away_after: Duration,
    xa_after: Duration,
    state: IdleState,
    idle_time: Duration,
}

impl IdleMonitor {
    pub fn new(config: &IdleConfig) -> Self {
        Self {
            away_after: Duration::from_secs(config.autoawaytime * 60),
            xa_after: Duration::from_secs(config.autoxatime * 60),
            state: IdleState::Awake,
            idle_time: Duration::ZERO,
        }
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    /// Idle time seen by the last update.
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    /// Feed a sample. Returns the new state if it changed.
    pub fn update(&mut self, idle_time: Duration, screensaver: bool) -> Option<IdleState> {
        self.idle_time = idle_time;
        let state = if screensaver || idle_time > self.xa_after {
            IdleState::Xa
        } else if idle_time > self.away_after {
            IdleState::Away
        } else {
            IdleState::Awake
        };
        if state == self.state {
            return None;
        }
        debug!(from = %self.state, to = %state, idle_secs = idle_time.as_secs(), "idle state changed");
        self.state = state;
        Some(state)
    }

    pub fn poll(&mut self, source: &dyn IdleSource) -> Option<IdleState> {
        let idle_time = source.idle_time()?;
        self.update(idle_time, source.screensaver_active())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<Duration>, bool);

    impl IdleSource for Fixed {
        fn idle_time(&self) -> Option<Duration> {
            self.0
        }

        fn screensaver_active(&self) -> bool {
            self.1
        }
    }

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn reports_transitions_only() {
        let mut monitor = IdleMonitor::new(&IdleConfig::default());
        assert_eq!(monitor.update(minutes(1), false), None);
        assert_eq!(monitor.update(minutes(6), false), Some(IdleState::Away));
        assert_eq!(monitor.update(minutes(7), false), None);
        assert_eq!(monitor.update(minutes(16), false), Some(IdleState::Xa));
        assert_eq!(monitor.update(Duration::ZERO, false), Some(IdleState::Awake));
    }

    #[test]
    fn long_idle_jumps_straight_to_xa() {
        let mut monitor = IdleMonitor::new(&IdleConfig::default());
        assert_eq!(monitor.update(minutes(30), false), Some(IdleState::Xa));
    }

    #[test]
    fn screensaver_forces_xa() {
        let mut monitor = IdleMonitor::new(&IdleConfig::default());
        assert_eq!(monitor.poll(&Fixed(Some(Duration::ZERO), true)), Some(IdleState::Xa));
        assert_eq!(monitor.poll(&Fixed(None, false)), None);
        assert_eq!(monitor.state(), IdleState::Xa);
    }
}
