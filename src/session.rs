use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    config::DetectorConfig,
    types::{SessionEvent, StatusSignal, TelemetrySample},
};

/// Debounce state of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Whether a session is in progress
    pub active: bool,
    /// Consecutive repeats of `last_status` after its first observation
    pub stable_repeat_count: u8,
    /// Last status observed, `None` before the first one
    pub last_status: Option<StatusSignal>,
}

/// Turns a stream of status signals into session start/end events
///
/// A status must be observed `confirmations + 1` times in a row before it
/// can flip the session. Each flip emits exactly one event.
#[derive(Debug, Clone)]
pub struct SessionDetector {
    state: SessionState,
    confirmations: u8,
}

impl Default for SessionDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default().confirmations)
    }
}

impl SessionDetector {
    /// Create a detector requiring `confirmations` repeats
    #[must_use]
    pub fn new(confirmations: u8) -> Self {
        Self {
            state: SessionState::default(),
            confirmations,
        }
    }

    /// Create a detector from configuration
    #[must_use]
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.confirmations)
    }

    /// Feed one status signal
    pub fn observe(&mut self, signal: StatusSignal) -> Option<SessionEvent> {
        if self.state.last_status == Some(signal) {
            self.state.stable_repeat_count = self.state.stable_repeat_count.saturating_add(1);
        } else {
            self.state.stable_repeat_count = 0;
            self.state.last_status = Some(signal);
        }

        if self.state.stable_repeat_count < self.confirmations {
            return None;
        }

        let active = signal.implies_active()?;
        if active == self.state.active {
            return None;
        }

        self.state.active = active;
        let event = if active {
            SessionEvent::Started
        } else {
            SessionEvent::Ended
        };
        debug!("{} on {} (repeats: {})", event, signal, self.state.stable_repeat_count);
        Some(event)
    }

    /// Whether a session is in progress
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.active
    }

    /// Current debounce state
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }
}

/// Consumer of session events and telemetry
///
/// Called from the tick loop in notification order.
pub trait SessionSink: Send + Sync {
    /// A session started
    fn on_session_started(&self);

    /// The active session ended
    fn on_session_ended(&self);

    /// Telemetry changed
    fn on_telemetry_updated(&self, sample: TelemetrySample);

    /// Route a detector event to the matching callback
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Started => self.on_session_started(),
            SessionEvent::Ended => self.on_session_ended(),
        }
    }
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl SessionSink for LogSink {
    fn on_session_started(&self) {
        info!("Session started");
    }

    fn on_session_ended(&self) {
        info!("Session ended");
    }

    fn on_telemetry_updated(&self, sample: TelemetrySample) {
        debug!(
            "Telemetry: {:.1} m, {} steps, {} s",
            sample.distance_meters, sample.steps, sample.duration_seconds
        );
    }
}

/// Message carried by [`ChannelSink`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SinkEvent {
    /// A session started
    Started,
    /// The active session ended
    Ended,
    /// Telemetry changed
    Telemetry(TelemetrySample),
}

/// Sink forwarding everything over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!("Sink receiver dropped, discarding {:?}", event);
        }
    }
}

impl SessionSink for ChannelSink {
    fn on_session_started(&self) {
        self.send(SinkEvent::Started);
    }

    fn on_session_ended(&self) {
        self.send(SinkEvent::Ended);
    }

    fn on_telemetry_updated(&self, sample: TelemetrySample) {
        self.send(SinkEvent::Telemetry(sample));
    }
}
