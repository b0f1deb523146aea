use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionConfig,
    error::{Error, Result},
    link::{ClientHandle, DeviceContext, Link, ScanArbiter},
    timer::IntervalTimer,
    types::PeerAddress,
};

/// Connection lifecycle of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the retry timer
    Idle,
    /// Scan in progress
    Scanning,
    /// Matching peripheral seen, connect scheduled
    Found(PeerAddress),
    /// Connect in flight
    Connecting,
    /// Connected, looking up characteristics
    Discovering,
    /// Notifications flowing
    Subscribed(ClientHandle),
    /// Scanner busy elsewhere; retry at the given time
    Backoff(Instant),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Found(address) => write!(f, "Found({address})"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Subscribed(client) => write!(f, "Subscribed({})", client.address),
            Self::Backoff(_) => write!(f, "Backoff"),
        }
    }
}

/// What the owning device should do after a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do this tick
    Waiting,
    /// Connected; the device must discover and subscribe, then call
    /// [`ConnectionStateMachine::on_subscribed`] or
    /// [`ConnectionStateMachine::abort`]
    Connected(ClientHandle),
    /// Subscribed and running
    Ready(ClientHandle),
    /// The link dropped since the last poll
    Lost,
}

/// Scan, connect and reconnect driver
///
/// One scan or connect attempt is outstanding at a time. A disconnect at
/// any point returns to [`ConnectionState::Idle`] and forgets the address.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    config: ConnectionConfig,
    context: Arc<DeviceContext>,
    retry: IntervalTimer,
    scan_started: Option<Instant>,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("device", &self.context.name())
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    /// Create an idle state machine for `context`
    #[must_use]
    pub fn new(context: Arc<DeviceContext>, config: ConnectionConfig) -> Self {
        let retry = IntervalTimer::from_millis(config.retry_interval_ms);
        Self {
            state: ConnectionState::Idle,
            config,
            context,
            retry,
            scan_started: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Connected client, once subscribed
    #[must_use]
    pub const fn client(&self) -> Option<&ClientHandle> {
        match &self.state {
            ConnectionState::Subscribed(client) => Some(client),
            _ => None,
        }
    }

    /// Whether notifications are flowing
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Subscribed(_))
    }

    /// Name of the owning device
    #[must_use]
    pub fn name(&self) -> &str {
        self.context.name()
    }

    fn go_idle(&mut self) {
        self.context.clear_found();
        self.scan_started = None;
        self.state = ConnectionState::Idle;
    }

    /// Advance the state machine
    ///
    /// # Errors
    ///
    /// Returns the link error of a failed scan start or connect; the state
    /// machine is back in [`ConnectionState::Idle`] when it does.
    pub async fn poll(
        &mut self,
        link: &dyn Link,
        arbiter: &ScanArbiter,
        now: Instant,
    ) -> Result<Step> {
        if self.context.take_link_lost() {
            if self.state == ConnectionState::Scanning {
                arbiter.release(&self.context);
            }
            info!("{}: link lost in state {}", self.name(), self.state);
            self.go_idle();
            return Ok(Step::Lost);
        }

        match self.state.clone() {
            ConnectionState::Idle => {
                if self.retry.is_interval_up(now) {
                    self.start_scan(link, arbiter, now).await?;
                }
                Ok(Step::Waiting)
            }
            ConnectionState::Backoff(until) => {
                if now >= until {
                    debug!("{}: backoff over", self.name());
                    self.state = ConnectionState::Idle;
                    self.retry.run_next_time_in(now, Duration::ZERO);
                }
                Ok(Step::Waiting)
            }
            ConnectionState::Scanning => {
                self.check_scan(link, arbiter, now).await;
                Ok(Step::Waiting)
            }
            ConnectionState::Found(address) => {
                if !self.retry.is_interval_up(now) {
                    return Ok(Step::Waiting);
                }
                self.connect(link, &address).await.map(Step::Connected)
            }
            ConnectionState::Connecting | ConnectionState::Discovering => Ok(Step::Waiting),
            ConnectionState::Subscribed(client) => Ok(Step::Ready(client)),
        }
    }

    async fn start_scan(&mut self, link: &dyn Link, arbiter: &ScanArbiter, now: Instant) -> Result<()> {
        if !arbiter.try_acquire(&self.context) {
            debug!(
                "{}: scanner held by {:?}, backing off",
                self.name(),
                arbiter.owner()
            );
            self.state = ConnectionState::Backoff(
                now + Duration::from_millis(self.config.arbiter_backoff_ms),
            );
            return Ok(());
        }

        info!("{}: scanning", self.name());
        self.context.begin_scan();
        let observer = self.context.clone();
        if let Err(e) = link
            .start_scan(self.context.filter(), self.config.scan_window(), observer)
            .await
        {
            arbiter.release(&self.context);
            return Err(e);
        }
        self.scan_started = Some(now);
        self.state = ConnectionState::Scanning;
        Ok(())
    }

    async fn check_scan(&mut self, link: &dyn Link, arbiter: &ScanArbiter, now: Instant) {
        let found = self.context.found();
        let window_closed = self.context.scan_ended()
            || self
                .scan_started
                .is_some_and(|started| now.saturating_duration_since(started) >= self.config.scan_window());

        if found.is_none() && !window_closed {
            return;
        }

        if let Err(e) = link.stop_scan().await {
            warn!("{}: failed to stop scan: {}", self.name(), e);
        }
        arbiter.release(&self.context);
        self.scan_started = None;

        if let Some(address) = found {
            self.retry.run_next_time_in(
                now,
                Duration::from_millis(self.config.found_connect_delay_ms),
            );
            self.state = ConnectionState::Found(address);
        } else {
            debug!("{}: nothing found", self.name());
            self.state = ConnectionState::Idle;
        }
    }

    async fn connect(&mut self, link: &dyn Link, address: &PeerAddress) -> Result<ClientHandle> {
        info!("{}: connecting to {}", self.name(), address);
        self.state = ConnectionState::Connecting;
        let observer = self.context.clone();
        match link.connect(address, observer).await {
            Ok(client) => {
                self.state = ConnectionState::Discovering;
                Ok(client)
            }
            Err(e) => {
                self.go_idle();
                Err(e)
            }
        }
    }

    /// Discovery and subscription succeeded
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when called outside discovery.
    pub fn on_subscribed(&mut self, client: ClientHandle) -> Result<()> {
        if self.state != ConnectionState::Discovering {
            return Err(Error::Protocol(format!(
                "subscribed while {}",
                self.state
            )));
        }
        info!("{}: subscribed to {}", self.name(), client.address);
        self.state = ConnectionState::Subscribed(client);
        Ok(())
    }

    /// Give up on the current connection and wait for the next retry
    pub async fn abort(&mut self, link: &dyn Link, client: &ClientHandle) {
        warn!("{}: dropping {}", self.name(), client.address);
        if let Err(e) = link.disconnect(client).await {
            warn!("{}: disconnect failed: {}", self.name(), e);
        }
        // our own disconnect must not be reported as a lost link later
        self.context.take_link_lost();
        self.go_idle();
    }
}
