use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use super::{Pipeline, Radio};
use crate::{
    config::DeviceConfig,
    connection::Step,
    error::{Error, Result},
    link::{CharacteristicHandle, ClientHandle, Link, Mailbox, ScanArbiter, ScanFilter},
    protocol::ftms::{
        decode_treadmill_data, FitnessMachineFeatures, MachineStatus, CONTROL_POINT_UUID,
        FEATURE_UUID, MACHINE_STATUS_UUID, REQUEST_CONTROL, RESET, SERVICE_UUID,
        TREADMILL_DATA_UUID,
    },
    session::SessionSink,
    types::DecodedFrame,
};

/// Treadmill speaking the standard fitness machine service
///
/// Telemetry comes from the Treadmill Data characteristic, run state from
/// Fitness Machine Status. Resets go through the control point when the
/// treadmill has one.
#[derive(Debug)]
pub struct FtmsDevice {
    pub(crate) pipeline: Pipeline,
    radio: Radio,
    data: Arc<Mailbox>,
    status: Arc<Mailbox>,
    control_point: Option<CharacteristicHandle>,
    features: Option<FitnessMachineFeatures>,
    last_distance: Option<f32>,
}

impl FtmsDevice {
    /// Configuration suited to this variant
    ///
    /// Machine status only notifies on change, so a single observation is
    /// enough to flip the session.
    #[must_use]
    pub fn default_config(name: &str) -> DeviceConfig {
        let mut config = DeviceConfig::named(name);
        config.detector.confirmations = 0;
        config
    }

    /// Create a device scanning for the fitness machine service
    #[must_use]
    pub fn new(
        config: &DeviceConfig,
        link: Arc<dyn Link>,
        arbiter: Arc<ScanArbiter>,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            pipeline: Pipeline::new(config, sink),
            radio: Radio::new(
                &config.name,
                ScanFilter::service(SERVICE_UUID),
                &config.connection,
                link,
                arbiter,
            ),
            data: Arc::new(Mailbox::new()),
            status: Arc::new(Mailbox::new()),
            control_point: None,
            features: None,
            last_distance: None,
        }
    }

    /// Whether notifications are flowing
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.radio.is_connected()
    }

    /// Features read during the last discovery
    #[must_use]
    pub const fn features(&self) -> Option<FitnessMachineFeatures> {
        self.features
    }

    /// Run one tick
    ///
    /// # Errors
    ///
    /// Returns link errors from scanning, connecting, discovery or the reset
    /// write.
    pub async fn poll(&mut self, now: Instant) -> Result<()> {
        match self.radio.poll(now).await? {
            Step::Waiting => Ok(()),
            Step::Lost => {
                self.forget_link();
                Ok(())
            }
            Step::Connected(client) => {
                let outcome = self.discover(&client).await;
                self.radio.finish_discovery(client, outcome).await
            }
            Step::Ready(client) => {
                self.drain(now);
                if self.pipeline.reset_due(now) {
                    self.send_reset(&client).await?;
                }
                Ok(())
            }
        }
    }

    async fn discover(&mut self, client: &ClientHandle) -> Result<()> {
        let name = self.pipeline.name().to_string();
        let service = self.radio.require_service(client, SERVICE_UUID).await?;

        if let Some(feature) = service.characteristic(FEATURE_UUID) {
            match self.radio.link().read(client, feature).await {
                Ok(value) => match FitnessMachineFeatures::parse(&value) {
                    Ok(features) => {
                        info!("{}: features: {}", name, features);
                        self.features = Some(features);
                    }
                    Err(e) => warn!("{}: unreadable feature value: {}", name, e),
                },
                Err(e) => warn!("{}: feature read failed: {}", name, e),
            }
        }

        let mut subscribed = false;
        if let Some(data) = service.characteristic(TREADMILL_DATA_UUID) {
            if data.props.can_subscribe() {
                self.radio.subscribe(client, data, &self.data).await?;
                info!(
                    "{}: subscribed to treadmill data (indicate: {})",
                    name, data.props.indicate
                );
                subscribed = true;
            } else {
                warn!("{}: treadmill data cannot notify", name);
            }
        }
        if let Some(status) = service.characteristic(MACHINE_STATUS_UUID) {
            if status.props.can_subscribe() {
                self.radio.subscribe(client, status, &self.status).await?;
                info!("{}: subscribed to machine status", name);
                subscribed = true;
            }
        }
        if !subscribed {
            return Err(Error::CharacteristicNotFound(TREADMILL_DATA_UUID));
        }

        self.control_point = service.characteristic(CONTROL_POINT_UUID).cloned();
        if self.control_point.is_none() {
            info!("{}: no control point, resets disabled", name);
        }
        Ok(())
    }

    fn drain(&mut self, now: Instant) {
        if let Some(payload) = self.data.take() {
            debug!("{}: data {:02X?}", self.pipeline.name(), payload);
            match decode_treadmill_data(&payload) {
                Ok(mut frame) => {
                    self.gate_step_estimate(&mut frame);
                    self.pipeline.apply(&frame, now);
                }
                Err(e) => warn!(
                    "{}: dropped frame {:02X?}: {}",
                    self.pipeline.name(),
                    payload,
                    e
                ),
            }
        }
        if let Some(payload) = self.status.take() {
            debug!("{}: status {:02X?}", self.pipeline.name(), payload);
            self.pipeline.ingest(&MachineStatus, &payload, now);
        }
    }

    // steps are only estimated while the distance grows
    fn gate_step_estimate(&mut self, frame: &mut DecodedFrame) {
        if let Some(distance) = frame.telemetry.distance_meters {
            if self.last_distance.is_some_and(|last| distance <= last) {
                frame.telemetry.steps = None;
            }
            self.last_distance = Some(distance);
        }
    }

    async fn send_reset(&self, client: &ClientHandle) -> Result<()> {
        let Some(control_point) = &self.control_point else {
            info!("{}: reset due but no control point", self.pipeline.name());
            return Ok(());
        };
        info!("{}: sending reset", self.pipeline.name());
        let link = self.radio.link();
        link.write(client, control_point, &REQUEST_CONTROL, true)
            .await?;
        link.write(client, control_point, &RESET, true).await
    }

    fn forget_link(&mut self) {
        self.data.take();
        self.status.take();
        self.control_point = None;
        self.last_distance = None;
    }
}
