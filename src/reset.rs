use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ResetConfig;

/// Reset request waiting to be sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReset {
    /// A reset is owed
    pub requested: bool,
    /// When the delay started; `None` for an immediate request
    #[serde(skip)]
    pub armed_at: Option<Instant>,
}

/// Delays the console reset that follows a session end
///
/// Fires at most once per arm.
#[derive(Debug, Clone)]
pub struct ResetSequencer {
    pending: PendingReset,
    delay: Duration,
}

impl Default for ResetSequencer {
    fn default() -> Self {
        Self::from_config(&ResetConfig::default())
    }
}

impl ResetSequencer {
    /// Create a sequencer firing `delay` after arming
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: PendingReset::default(),
            delay,
        }
    }

    /// Create a sequencer from configuration
    #[must_use]
    pub fn from_config(config: &ResetConfig) -> Self {
        Self::new(Duration::from_millis(config.delay_after_session_end_ms))
    }

    /// Start the delay, replacing any earlier arm
    pub fn arm(&mut self, now: Instant) {
        debug!("Reset armed, fires in {:?}", self.delay);
        self.pending = PendingReset {
            requested: true,
            armed_at: Some(now),
        };
    }

    /// Request a reset on the next poll
    pub fn request_immediate(&mut self) {
        self.pending = PendingReset {
            requested: true,
            armed_at: None,
        };
    }

    /// Check whether the reset is due, consuming the request when it is
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.pending.requested {
            return false;
        }
        let due = self
            .pending
            .armed_at
            .is_none_or(|armed| now.saturating_duration_since(armed) >= self.delay);
        if due {
            self.pending = PendingReset::default();
        }
        due
    }

    /// Current request state
    #[must_use]
    pub const fn pending(&self) -> &PendingReset {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_fires_once_after_delay() {
        let mut reset = ResetSequencer::default();
        let t0 = Instant::now();

        assert!(!reset.poll(t0));
        reset.arm(t0);
        assert!(!reset.poll(t0 + 4_999 * MS));
        assert!(reset.poll(t0 + 5_000 * MS));
        assert!(!reset.poll(t0 + 5_001 * MS));
        assert!(!reset.poll(t0 + 60_000 * MS));
        assert_eq!(*reset.pending(), PendingReset::default());
    }

    #[test]
    fn test_immediate_request() {
        let mut reset = ResetSequencer::new(5_000 * MS);
        let t0 = Instant::now();

        reset.request_immediate();
        assert!(reset.pending().requested);
        assert!(reset.poll(t0));
        assert!(!reset.poll(t0));
    }

    #[test]
    fn test_rearm_restarts_delay() {
        let mut reset = ResetSequencer::new(1_000 * MS);
        let t0 = Instant::now();

        reset.arm(t0);
        reset.arm(t0 + 800 * MS);
        assert!(!reset.poll(t0 + 1_000 * MS));
        assert!(reset.poll(t0 + 1_800 * MS));
    }
}
