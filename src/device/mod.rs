//! Treadmill device variants
//!
//! Every variant owns its decoder, session detector, reset sequencer and
//! telemetry, and is driven by repeated calls to `poll`. The BLE variants
//! share the scan/connect plumbing in [`Radio`]; the wired variant reads its
//! [`Bus`](crate::bus::Bus) directly.

use std::{sync::Arc, time::Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{ConnectionConfig, DeviceConfig},
    connection::{ConnectionStateMachine, Step},
    error::{Error, Result},
    link::{
        CharacteristicHandle, ClientHandle, DeviceContext, Link, Mailbox, ScanArbiter,
        ScanFilter, ServiceHandle,
    },
    protocol::Decoder,
    reset::ResetSequencer,
    session::{SessionDetector, SessionSink},
    types::{DecodedFrame, SessionEvent, TelemetrySample},
};

/// Opcode polling console
pub mod console;
/// Standards-based fitness machine
pub mod ftms;
/// Proprietary notify stream
pub mod proprietary;
/// Passive wired bus observer
pub mod snoop;

pub use console::ConsoleDevice;
pub use ftms::FtmsDevice;
pub use proprietary::ProprietaryDevice;
pub use snoop::SnoopDevice;

/// Decode, detect and publish chain of one device
pub struct Pipeline {
    name: String,
    sink: Arc<dyn SessionSink>,
    detector: SessionDetector,
    reset: ResetSequencer,
    telemetry: TelemetrySample,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("detector", &self.detector)
            .field("reset", &self.reset)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline from the device configuration
    #[must_use]
    pub fn new(config: &DeviceConfig, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            name: config.name.clone(),
            sink,
            detector: SessionDetector::from_config(&config.detector),
            reset: ResetSequencer::from_config(&config.reset),
            telemetry: TelemetrySample::default(),
        }
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Merge a decoded frame and feed its status to the detector
    ///
    /// Telemetry is published before the session event so a session end
    /// carries the final counters. Arms the reset on session end.
    pub fn apply(&mut self, frame: &DecodedFrame, now: Instant) -> Option<SessionEvent> {
        if self.telemetry.apply(&frame.telemetry) {
            self.sink.on_telemetry_updated(self.telemetry);
        }

        let event = self.detector.observe(frame.status?)?;
        info!("{}: {}", self.name, event);
        self.sink.on_event(event);
        if event == SessionEvent::Ended {
            self.reset.arm(now);
        }
        Some(event)
    }

    /// Decode a payload and apply it; malformed frames are logged and dropped
    pub fn ingest(
        &mut self,
        decoder: &impl Decoder,
        payload: &[u8],
        now: Instant,
    ) -> Option<SessionEvent> {
        match decoder.decode(payload) {
            Ok(frame) => self.apply(&frame, now),
            Err(e) => {
                warn!("{}: dropped frame {:02X?}: {}", self.name, payload, e);
                None
            }
        }
    }

    /// Whether the reset is due, consuming it when it is
    pub fn reset_due(&mut self, now: Instant) -> bool {
        self.reset.poll(now)
    }

    /// Reset on the next poll
    pub fn request_reset(&mut self) {
        self.reset.request_immediate();
    }

    /// Current telemetry
    #[must_use]
    pub const fn telemetry(&self) -> TelemetrySample {
        self.telemetry
    }

    /// Whether a session is in progress
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.detector.is_active()
    }
}

/// Link, scanner and connection state of a BLE device
pub struct Radio {
    link: Arc<dyn Link>,
    arbiter: Arc<ScanArbiter>,
    connection: ConnectionStateMachine,
}

impl std::fmt::Debug for Radio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Radio")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Radio {
    /// Create the radio side of the device called `name`
    #[must_use]
    pub fn new(
        name: &str,
        filter: ScanFilter,
        config: &ConnectionConfig,
        link: Arc<dyn Link>,
        arbiter: Arc<ScanArbiter>,
    ) -> Self {
        let context = Arc::new(DeviceContext::new(name, filter));
        Self {
            link,
            arbiter,
            connection: ConnectionStateMachine::new(context, config.clone()),
        }
    }

    /// Advance the connection state machine
    ///
    /// # Errors
    ///
    /// Returns the link error of a failed scan or connect.
    pub async fn poll(&mut self, now: Instant) -> Result<Step> {
        self.connection
            .poll(self.link.as_ref(), &self.arbiter, now)
            .await
    }

    /// The link
    #[must_use]
    pub fn link(&self) -> &dyn Link {
        self.link.as_ref()
    }

    /// Connection state machine
    #[must_use]
    pub const fn connection(&self) -> &ConnectionStateMachine {
        &self.connection
    }

    /// Whether notifications are flowing
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Look up a service the device cannot work without
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] when the peer lacks it.
    pub async fn require_service(&self, client: &ClientHandle, uuid: Uuid) -> Result<ServiceHandle> {
        self.link
            .get_service(client, uuid)
            .await?
            .ok_or(Error::ServiceNotFound(uuid))
    }

    /// Subscribe `mailbox` to `characteristic`
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] when the characteristic can
    /// neither notify nor indicate, or the link error.
    pub async fn subscribe(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
        mailbox: &Arc<Mailbox>,
    ) -> Result<()> {
        if !characteristic.props.can_subscribe() {
            return Err(Error::CharacteristicNotFound(characteristic.uuid));
        }
        self.link
            .subscribe(client, characteristic, mailbox.clone())
            .await
    }

    /// Close the discovery phase with its outcome
    ///
    /// # Errors
    ///
    /// Returns the discovery error after disconnecting.
    pub async fn finish_discovery(&mut self, client: ClientHandle, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => self.connection.on_subscribed(client),
            Err(e) => {
                warn!("{}: discovery failed: {}", self.connection.name(), e);
                self.connection.abort(self.link.as_ref(), &client).await;
                Err(e)
            }
        }
    }
}

/// Look up a characteristic the device cannot work without
///
/// # Errors
///
/// Returns [`Error::CharacteristicNotFound`] when the service lacks it.
pub fn require_characteristic(
    service: &ServiceHandle,
    uuid: Uuid,
) -> Result<CharacteristicHandle> {
    service
        .characteristic(uuid)
        .cloned()
        .ok_or(Error::CharacteristicNotFound(uuid))
}

/// One treadmill of any supported kind
#[derive(Debug)]
pub enum DeviceKind {
    /// Standards-based fitness machine
    Ftms(FtmsDevice),
    /// Proprietary notify stream
    Proprietary(ProprietaryDevice),
    /// Opcode polling console
    PollingConsole(ConsoleDevice),
    /// Passive wired bus observer
    SerialSnoop(SnoopDevice),
}

impl DeviceKind {
    /// Run one tick: connect, drain notifications, send due commands
    ///
    /// # Errors
    ///
    /// Returns link and bus errors; the device stays usable and retries on
    /// later ticks.
    pub async fn poll(&mut self, now: Instant) -> Result<()> {
        match self {
            Self::Ftms(device) => device.poll(now).await,
            Self::Proprietary(device) => device.poll(now).await,
            Self::PollingConsole(device) => device.poll(now).await,
            Self::SerialSnoop(device) => device.poll(now),
        }
    }

    /// Whether the device is receiving data
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Ftms(device) => device.is_connected(),
            Self::Proprietary(device) => device.is_connected(),
            Self::PollingConsole(device) => device.is_connected(),
            Self::SerialSnoop(device) => device.is_connected(),
        }
    }

    /// Send the reset command on the next tick, skipping the delay
    pub fn request_reset(&mut self) {
        self.pipeline_mut().request_reset();
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        self.pipeline().name()
    }

    /// Current telemetry
    #[must_use]
    pub fn telemetry(&self) -> TelemetrySample {
        self.pipeline().telemetry()
    }

    /// Whether a session is in progress
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.pipeline().is_active()
    }

    fn pipeline(&self) -> &Pipeline {
        match self {
            Self::Ftms(device) => &device.pipeline,
            Self::Proprietary(device) => &device.pipeline,
            Self::PollingConsole(device) => &device.pipeline,
            Self::SerialSnoop(device) => &device.pipeline,
        }
    }

    fn pipeline_mut(&mut self) -> &mut Pipeline {
        match self {
            Self::Ftms(device) => &mut device.pipeline,
            Self::Proprietary(device) => &mut device.pipeline,
            Self::PollingConsole(device) => &mut device.pipeline,
            Self::SerialSnoop(device) => &mut device.pipeline,
        }
    }
}

impl From<FtmsDevice> for DeviceKind {
    fn from(device: FtmsDevice) -> Self {
        Self::Ftms(device)
    }
}

impl From<ProprietaryDevice> for DeviceKind {
    fn from(device: ProprietaryDevice) -> Self {
        Self::Proprietary(device)
    }
}

impl From<ConsoleDevice> for DeviceKind {
    fn from(device: ConsoleDevice) -> Self {
        Self::PollingConsole(device)
    }
}

impl From<SnoopDevice> for DeviceKind {
    fn from(device: SnoopDevice) -> Self {
        Self::SerialSnoop(device)
    }
}
