use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::{config::PollingConfig, protocol::console::Opcode};

/// Rotation state of the polling scheduler
#[derive(Debug, Clone)]
pub struct PollCycle {
    /// Opcodes queried in turn
    pub command_order: Vec<Opcode>,
    /// Position of the next opcode to send
    pub index: usize,
    /// Opcode of the last request sent
    pub last_sent_opcode: Option<Opcode>,
    /// When the last request was sent
    pub last_sent_at: Option<Instant>,
    /// Whether the last request is still unanswered
    pub awaiting_response: bool,
    /// Requests sent in a row without an answer to the previous one
    pub consecutive_misses: u8,
}

/// Paces opcode requests to a request/response console
///
/// The next request goes out once the previous one was answered and the
/// minimum interval passed, or once the maximum interval passed regardless.
/// The rotation always advances.
#[derive(Debug, Clone)]
pub struct PollingScheduler {
    cycle: PollCycle,
    min_interval: Duration,
    max_interval: Duration,
}

impl PollingScheduler {
    /// Create a scheduler over `order`
    #[must_use]
    pub fn new(order: &[Opcode], config: &PollingConfig) -> Self {
        Self {
            cycle: PollCycle {
                command_order: order.to_vec(),
                index: 0,
                last_sent_opcode: None,
                last_sent_at: None,
                awaiting_response: false,
                consecutive_misses: 0,
            },
            min_interval: Duration::from_millis(config.min_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
        }
    }

    /// Next request frame if one is due
    pub fn maybe_send(&mut self, now: Instant) -> Option<[u8; 6]> {
        let opcode = *self.cycle.command_order.get(self.cycle.index)?;

        let elapsed = self
            .cycle
            .last_sent_at
            .map(|sent| now.saturating_duration_since(sent));
        let answered = !self.cycle.awaiting_response;
        let can_send = answered && elapsed.is_none_or(|e| e >= self.min_interval);
        let forced = elapsed.is_some_and(|e| e >= self.max_interval);

        if !can_send && !forced {
            return None;
        }

        if self.cycle.awaiting_response {
            self.cycle.consecutive_misses = self.cycle.consecutive_misses.saturating_add(1);
            debug!(
                "No response to {:?}, sending {} anyway (misses: {})",
                self.cycle.last_sent_opcode, opcode, self.cycle.consecutive_misses
            );
        }

        trace!("REQ {}: {}", self.cycle.index, opcode);
        self.cycle.last_sent_opcode = Some(opcode);
        self.cycle.last_sent_at = Some(now);
        self.cycle.awaiting_response = true;
        self.cycle.index = (self.cycle.index + 1) % self.cycle.command_order.len();

        Some(opcode.request())
    }

    /// Record that a response arrived, valid or not
    pub fn on_response(&mut self) {
        self.cycle.awaiting_response = false;
        self.cycle.consecutive_misses = 0;
    }

    /// Opcode the next response answers
    #[must_use]
    pub const fn last_sent_opcode(&self) -> Option<Opcode> {
        self.cycle.last_sent_opcode
    }

    /// Current rotation state
    #[must_use]
    pub const fn cycle(&self) -> &PollCycle {
        &self.cycle
    }

    /// Start the rotation over, e.g. after a reconnect
    pub fn restart(&mut self) {
        self.cycle.index = 0;
        self.cycle.last_sent_opcode = None;
        self.cycle.last_sent_at = None;
        self.cycle.awaiting_response = false;
        self.cycle.consecutive_misses = 0;
    }
}
