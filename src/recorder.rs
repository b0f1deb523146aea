use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};

use crate::{session::SessionSink, types::TelemetrySample};

/// One completed workout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkoutSession {
    /// Start time, seconds since the Unix epoch
    pub start: u64,
    /// Stop time, seconds since the Unix epoch
    pub stop: u64,
    /// Steps counted during the session
    pub steps: u32,
}

impl WorkoutSession {
    /// Session length in seconds
    #[must_use]
    pub const fn duration_seconds(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }
}

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Default)]
struct RecorderState {
    started_at: Option<u64>,
    latest: TelemetrySample,
    sessions: Vec<WorkoutSession>,
}

/// In-memory workout log
///
/// Records a [`WorkoutSession`] for every start/end pair with the step count
/// of the last telemetry update seen before the end.
pub struct SessionRecorder {
    state: Mutex<RecorderState>,
    clock: Clock,
}

impl fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecorder")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl SessionRecorder {
    /// Create a recorder using the system clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(unix_seconds)
    }

    /// Create a recorder with a custom epoch-seconds clock
    #[must_use]
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(RecorderState::default()),
            clock: Box::new(clock),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed sessions, oldest first
    #[must_use]
    pub fn sessions(&self) -> Vec<WorkoutSession> {
        self.lock().sessions.clone()
    }

    /// Whether a session is being recorded
    #[must_use]
    pub fn in_session(&self) -> bool {
        self.lock().started_at.is_some()
    }

    /// Most recent telemetry
    #[must_use]
    pub fn latest(&self) -> TelemetrySample {
        self.lock().latest
    }

    /// Remove and return the completed sessions
    pub fn take_sessions(&self) -> Vec<WorkoutSession> {
        std::mem::take(&mut self.lock().sessions)
    }
}

impl SessionSink for SessionRecorder {
    fn on_session_started(&self) {
        let now = (self.clock)();
        let mut state = self.lock();
        if state.started_at.is_some() {
            warn!("Session start while already recording, restarting at {}", now);
        }
        // the sample decoded with the start frame is already in `latest`
        state.started_at = Some(now);
    }

    fn on_session_ended(&self) {
        let now = (self.clock)();
        let mut state = self.lock();
        let Some(start) = state.started_at.take() else {
            warn!("Session end without a recorded start");
            return;
        };
        let session = WorkoutSession {
            start,
            stop: now,
            steps: state.latest.steps,
        };
        info!(
            "Recorded session: {} steps over {} s",
            session.steps,
            session.duration_seconds()
        );
        state.sessions.push(session);
    }

    fn on_telemetry_updated(&self, sample: TelemetrySample) {
        self.lock().latest = sample;
    }
}
