use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use super::{require_characteristic, Pipeline, Radio};
use crate::{
    config::DeviceConfig,
    connection::Step,
    error::Result,
    link::{CharacteristicHandle, ClientHandle, Link, Mailbox, ScanArbiter, ScanFilter},
    protocol::{
        ftms,
        proprietary::{ProprietaryStream, NOTIFY_UUID, SERVICE_UUID, START_STREAM, WRITE_UUID},
    },
    session::SessionSink,
};

/// Treadmill streaming a vendor notify format next to its fitness machine
/// service
///
/// The stream has to be started with a write after subscribing, and stops
/// silently after every control point write, so a reset is followed by a
/// delayed restart.
#[derive(Debug)]
pub struct ProprietaryDevice {
    pub(crate) pipeline: Pipeline,
    radio: Radio,
    stream: Arc<Mailbox>,
    write: Option<CharacteristicHandle>,
    control_point: Option<CharacteristicHandle>,
    restart_delay: Duration,
    restart_at: Option<Instant>,
}

impl ProprietaryDevice {
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
                ScanFilter::service(ftms::SERVICE_UUID),
                &config.connection,
                link,
                arbiter,
            ),
            stream: Arc::new(Mailbox::new()),
            write: None,
            control_point: None,
            restart_delay: Duration::from_millis(config.reset.stream_restart_delay_ms),
            restart_at: None,
        }
    }

    /// Whether the stream is subscribed
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.radio.is_connected()
    }

    /// Run one tick
    ///
    /// # Errors
    ///
    /// Returns link errors from scanning, connecting, discovery and the
    /// reset or restart writes.
    pub async fn poll(&mut self, now: Instant) -> Result<()> {
        match self.radio.poll(now).await? {
            Step::Waiting => Ok(()),
            Step::Lost => {
                self.stream.take();
                self.write = None;
                self.control_point = None;
                self.restart_at = None;
                Ok(())
            }
            Step::Connected(client) => {
                let outcome = self.discover(&client).await;
                self.radio.finish_discovery(client, outcome).await
            }
            Step::Ready(client) => {
                if let Some(payload) = self.stream.take() {
                    debug!("{}: frame {:02X?}", self.pipeline.name(), payload);
                    self.pipeline.ingest(&ProprietaryStream, &payload, now);
                }
                if self.pipeline.reset_due(now) {
                    self.send_reset(&client, now).await?;
                }
                if self.restart_at.is_some_and(|at| now >= at) {
                    self.restart_at = None;
                    info!("{}: restarting stream", self.pipeline.name());
                    self.start_stream(&client).await?;
                }
                Ok(())
            }
        }
    }

    async fn discover(&mut self, client: &ClientHandle) -> Result<()> {
        let fitness = self.radio.require_service(client, ftms::SERVICE_UUID).await?;
        let control_point = fitness.characteristic(ftms::CONTROL_POINT_UUID).cloned();
        if control_point.is_none() {
            info!("{}: no control point, resets disabled", self.pipeline.name());
        }

        let vendor = self.radio.require_service(client, SERVICE_UUID).await?;
        let notify = require_characteristic(&vendor, NOTIFY_UUID)?;
        let write = require_characteristic(&vendor, WRITE_UUID)?;

        self.radio.subscribe(client, &notify, &self.stream).await?;
        self.control_point = control_point;
        self.write = Some(write);
        self.start_stream(client).await
    }

    async fn start_stream(&self, client: &ClientHandle) -> Result<()> {
        if let Some(write) = &self.write {
            self.radio
                .link()
                .write(client, write, &START_STREAM, true)
                .await?;
            debug!("{}: start stream sent", self.pipeline.name());
        }
        Ok(())
    }

    async fn send_reset(&mut self, client: &ClientHandle, now: Instant) -> Result<()> {
        let Some(control_point) = &self.control_point else {
            info!("{}: reset due but no control point", self.pipeline.name());
            return Ok(());
        };
        info!("{}: sending reset", self.pipeline.name());
        // Any control point write stops the stream, even one that then fails
        self.restart_at = Some(now + self.restart_delay);
        let link = self.radio.link();
        link.write(client, control_point, &ftms::REQUEST_CONTROL, true)
            .await?;
        link.write(client, control_point, &ftms::RESET, true).await

    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        link::fake::{props, FakeLink, LinkCall},
        session::{ChannelSink, SinkEvent},
        types::Advertisement,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    const MS: Duration = Duration::from_millis(1);

    const RUNNING: [u8; 19] = [
        0x02, 0x51, 0x03, 0x0E, 0x00, 0x7C, 0x00, 0x03, 0x00, 0x2C, 0x00, 0x7E, 0x00, 0x00, 0x00,
        0x00, 0x00, 0xD7, 0x03,
    ];
    const OFF: [u8; 6] = [0x02, 0x51, 0x06, 0x00, 0x00, 0x00];

    fn vendor_link() -> Arc<FakeLink> {
        let link = FakeLink::new();
        link.add_service(
            ftms::SERVICE_UUID,
            &[
                (ftms::TREADMILL_DATA_UUID, props(true, false, false)),
                (ftms::CONTROL_POINT_UUID, props(false, true, true)),
            ],
        );
        link.add_service(
            SERVICE_UUID,
            &[
                (NOTIFY_UUID, props(true, false, false)),
                (WRITE_UUID, props(false, false, true)),
            ],
        );
        link
    }

    fn device(link: &Arc<FakeLink>) -> (ProprietaryDevice, UnboundedReceiver<SinkEvent>) {
        let (sink, rx) = ChannelSink::channel();
        let device = ProprietaryDevice::new(
            &DeviceConfig::named("vendor"),
            link.clone(),
            Arc::new(ScanArbiter::new()),
            Arc::new(sink),
        );
        (device, rx)
    }

    async fn connect(device: &mut ProprietaryDevice, link: &FakeLink, t0: Instant) {
        device.poll(t0).await.unwrap();
        link.advertise(&Advertisement::new("DE:AD").with_service(ftms::SERVICE_UUID));
        device.poll(t0 + MS).await.unwrap();
        device.poll(t0 + 200 * MS).await.unwrap();
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_then_start_stream() {
        let link = vendor_link();
        let (mut device, _rx) = device(&link);
        connect(&mut device, &link, Instant::now()).await;

        let calls = link.calls();
        let subscribed = calls
            .iter()
            .position(|c| *c == LinkCall::Subscribe(NOTIFY_UUID))
            .unwrap();
        let started = calls
            .iter()
            .position(|c| *c == LinkCall::Write(WRITE_UUID, START_STREAM.to_vec(), true))
            .unwrap();
        assert!(subscribed < started);
    }

    #[tokio::test]
    async fn test_session_reset_and_stream_restart() {
        let link = vendor_link();
        let (mut device, mut rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        for (i, frame) in [&RUNNING[..], &RUNNING[..]].into_iter().enumerate() {
            link.notify(NOTIFY_UUID, frame);
            device.poll(t0 + (300 + 100 * i as u32) * MS).await.unwrap();
        }
        assert!(matches!(rx.try_recv().unwrap(), SinkEvent::Telemetry(s) if s.steps == 126));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Started);

        link.notify(NOTIFY_UUID, &OFF);
        device.poll(t0 + 1_000 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &OFF);
        device.poll(t0 + 1_100 * MS).await.unwrap();
        // belt speed drops to zero before the session closes
        assert!(matches!(
            rx.try_recv().unwrap(),
            SinkEvent::Telemetry(s) if s.speed_kph == Some(0.0)
        ));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Ended);

        link.clear_calls();
        device.poll(t0 + 6_100 * MS).await.unwrap();
        assert_eq!(
            link.writes(),
            vec![
                (ftms::CONTROL_POINT_UUID, ftms::REQUEST_CONTROL.to_vec()),
                (ftms::CONTROL_POINT_UUID, ftms::RESET.to_vec()),
            ]
        );

        device.poll(t0 + 7_099 * MS).await.unwrap();
        assert_eq!(link.writes().len(), 2);

        device.poll(t0 + 7_100 * MS).await.unwrap();
        assert_eq!(
            link.writes().last(),
            Some(&(WRITE_UUID, START_STREAM.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_failed_reset_still_restarts_stream() {
        let link = vendor_link();
        link.reject_write(&ftms::RESET);
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;
        link.clear_calls();

        device.pipeline.request_reset();
        let err = device.poll(t0 + 300 * MS).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(device.is_connected());

        device.poll(t0 + 1_299 * MS).await.unwrap();
        assert!(!link
            .writes()
            .contains(&(WRITE_UUID, START_STREAM.to_vec())));

        device.poll(t0 + 1_300 * MS).await.unwrap();
        assert_eq!(
            link.writes(),
            vec![
                (ftms::CONTROL_POINT_UUID, ftms::REQUEST_CONTROL.to_vec()),
                (ftms::CONTROL_POINT_UUID, ftms::RESET.to_vec()),
                (WRITE_UUID, START_STREAM.to_vec()),
            ]
        );
        assert!(device.restart_at.is_none());
    }

    #[tokio::test]
    async fn test_pausing_code_holds_state() {
        let link = vendor_link();
        let (mut device, mut rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        let mut pausing = RUNNING;
        pausing[2] = 0x04;
        for i in 0..3 {
            link.notify(NOTIFY_UUID, &pausing);
            device.poll(t0 + (300 + 100 * i) * MS).await.unwrap();
        }
        assert!(matches!(rx.try_recv().unwrap(), SinkEvent::Telemetry(_)));
        assert!(rx.try_recv().is_err());
        assert!(!device.pipeline.is_active());
    }

    #[tokio::test]
    async fn test_missing_vendor_service() {
        let link = FakeLink::new();
        link.add_service(ftms::SERVICE_UUID, &[]);
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();

        device.poll(t0).await.unwrap();
        link.advertise(&Advertisement::new("DE:AD").with_service(ftms::SERVICE_UUID));
        device.poll(t0 + MS).await.unwrap();

        let err = device.poll(t0 + 200 * MS).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(uuid) if uuid == SERVICE_UUID));
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_missing_write_characteristic() {
        let link = FakeLink::new();
        link.add_service(ftms::SERVICE_UUID, &[]);
        link.add_service(SERVICE_UUID, &[(NOTIFY_UUID, props(true, false, false))]);
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();

        device.poll(t0).await.unwrap();
        link.advertise(&Advertisement::new("DE:AD").with_service(ftms::SERVICE_UUID));
        device.poll(t0 + MS).await.unwrap();

        let err = device.poll(t0 + 200 * MS).await.unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound(uuid) if uuid == WRITE_UUID));
    }

    #[tokio::test]
    async fn test_link_loss_cancels_restart() {
        let link = vendor_link();
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.pipeline.request_reset();
        device.poll(t0 + 300 * MS).await.unwrap();
        assert!(device.restart_at.is_some());

        link.drop_link();
        device.poll(t0 + 400 * MS).await.unwrap();
        assert!(device.restart_at.is_none());
        assert!(!device.is_connected());
    }
}
