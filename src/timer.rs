use std::time::{Duration, Instant};

/// "Has N milliseconds elapsed since the last mark" check
///
/// The timer is driven by explicit timestamps so callers decide what "now"
/// means. A fresh timer is due immediately. [`IntervalTimer::run_next_time_in`]
/// overrides the interval once; the default applies again after it fires.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    default_interval: Duration,
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalTimer {
    /// Create a timer that is due on its first check
    #[must_use]
    pub const fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            interval: default_interval,
            last: None,
        }
    }

    /// Create a timer from milliseconds
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Check whether the interval elapsed, re-marking the timer when it did
    pub fn is_interval_up(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.interval = self.default_interval;
            self.last = Some(now);
        }
        due
    }

    /// Fire once after `next` instead of the default interval
    pub const fn run_next_time_in(&mut self, now: Instant, next: Duration) {
        self.last = Some(now);
        self.interval = next;
    }

    /// Mark the timer without firing
    pub const fn reset(&mut self, now: Instant) {
        self.last = Some(now);
    }

    /// Time since the timer was last marked, `None` if never marked
    #[must_use]
    pub fn time_since_last(&self, now: Instant) -> Option<Duration> {
        self.last.map(|last| now.saturating_duration_since(last))
    }

    /// Interval the timer uses when not overridden
    #[must_use]
    pub const fn default_interval(&self) -> Duration {
        self.default_interval
    }
}
