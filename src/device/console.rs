use std::{sync::Arc, time::Instant};
use tracing::{debug, info, trace};

use super::{require_characteristic, Pipeline, Radio};
use crate::{
    config::DeviceConfig,
    connection::Step,
    error::Result,
    link::{CharacteristicHandle, ClientHandle, Link, Mailbox, ScanArbiter, ScanFilter},
    polling::PollingScheduler,
    protocol::console::{
        ConsoleResponse, NAME_PREFIX, NOTIFY_UUID, POLL_ORDER, SERVICE_UUID, WRITE_UUID,
    },
    session::SessionSink,
};

/// Console answering one opcode query at a time
///
/// Responses carry no opcode, so each one is decoded against the last
/// request sent.
#[derive(Debug)]
pub struct ConsoleDevice {
    pub(crate) pipeline: Pipeline,
    radio: Radio,
    responses: Arc<Mailbox>,
    requests: Option<CharacteristicHandle>,
    polling: PollingScheduler,
}

impl ConsoleDevice {
    /// Create a device scanning for the console's advertised name
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
                ScanFilter::named(NAME_PREFIX),
                &config.connection,
                link,
                arbiter,
            ),
            responses: Arc::new(Mailbox::new()),
            requests: None,
            polling: PollingScheduler::new(&POLL_ORDER, &config.polling),
        }
    }

    /// Whether responses are subscribed
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.radio.is_connected()
    }

    /// Opcode rotation state
    #[must_use]
    pub const fn polling(&self) -> &PollingScheduler {
        &self.polling
    }

    /// Run one tick
    ///
    /// # Errors
    ///
    /// Returns link errors from scanning, connecting, discovery and request
    /// writes.
    pub async fn poll(&mut self, now: Instant) -> Result<()> {
        match self.radio.poll(now).await? {
            Step::Waiting => Ok(()),
            Step::Lost => {
                self.responses.take();
                self.requests = None;
                self.polling.restart();
                Ok(())
            }
            Step::Connected(client) => {
                let outcome = self.discover(&client).await;
                self.radio.finish_discovery(client, outcome).await
            }
            Step::Ready(client) => {
                self.drain(now);
                if self.pipeline.reset_due(now) {
                    info!(
                        "{}: reset due, console has no reset command",
                        self.pipeline.name()
                    );
                }
                self.send_next(&client, now).await
            }
        }
    }

    async fn discover(&mut self, client: &ClientHandle) -> Result<()> {
        let service = self.radio.require_service(client, SERVICE_UUID).await?;
        let notify = require_characteristic(&service, NOTIFY_UUID)?;
        let write = require_characteristic(&service, WRITE_UUID)?;

        self.radio.subscribe(client, &notify, &self.responses).await?;
        self.requests = Some(write);
        self.polling.restart();
        Ok(())
    }

    fn drain(&mut self, now: Instant) {
        let Some(payload) = self.responses.take() else {
            return;
        };
        match self.polling.last_sent_opcode() {
            Some(opcode) => {
                trace!("{}: RESP {}: {:02X?}", self.pipeline.name(), opcode, payload);
                self.pipeline
                    .ingest(&ConsoleResponse { opcode }, &payload, now);
            }
            None => debug!(
                "{}: unsolicited response {:02X?}",
                self.pipeline.name(),
                payload
            ),
        }
        self.polling.on_response();
    }

    async fn send_next(&mut self, client: &ClientHandle, now: Instant) -> Result<()> {
        let Some(requests) = &self.requests else {
            return Ok(());
        };
        if let Some(frame) = self.polling.maybe_send(now) {
            self.radio
                .link()
                .write(client, requests, &frame, false)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::fake::{props, FakeLink, LinkCall},
        protocol::console::Opcode,
        session::{ChannelSink, SinkEvent},
        types::Advertisement,
    };
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const MS: Duration = Duration::from_millis(1);

    fn console_link() -> Arc<FakeLink> {
        let link = FakeLink::new();
        link.add_service(
            SERVICE_UUID,
            &[
                (NOTIFY_UUID, props(true, false, false)),
                (WRITE_UUID, props(false, false, true)),
            ],
        );
        link
    }

    fn device(link: &Arc<FakeLink>) -> (ConsoleDevice, UnboundedReceiver<SinkEvent>) {
        let (sink, rx) = ChannelSink::channel();
        let device = ConsoleDevice::new(
            &DeviceConfig::named("console"),
            link.clone(),
            Arc::new(ScanArbiter::new()),
            Arc::new(sink),
        );
        (device, rx)
    }

    async fn connect(device: &mut ConsoleDevice, link: &FakeLink, t0: Instant) {
        device.poll(t0).await.unwrap();
        link.advertise(&Advertisement::new("5A:5A").with_name("LifeSpan-TM 5000"));
        device.poll(t0 + MS).await.unwrap();
        device.poll(t0 + 200 * MS).await.unwrap();
        assert!(device.is_connected());
        link.clear_calls();
    }

    fn request(opcode: Opcode) -> (uuid::Uuid, Vec<u8>) {
        (WRITE_UUID, opcode.request().to_vec())
    }

    #[tokio::test]
    async fn test_scans_by_name() {
        let link = console_link();
        let (mut device, _rx) = device(&link);

        device.poll(Instant::now()).await.unwrap();
        assert_eq!(
            link.calls(),
            vec![LinkCall::StartScan(ScanFilter::named("LifeSpan-TM"))]
        );
    }

    #[tokio::test]
    async fn test_request_response_rotation() {
        let link = console_link();
        let (mut device, mut rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.poll(t0 + 300 * MS).await.unwrap();
        assert_eq!(link.writes(), vec![request(Opcode::Steps)]);
        assert!(link
            .calls()
            .contains(&LinkCall::Write(WRITE_UUID, Opcode::Steps.request().to_vec(), false)));

        link.notify(NOTIFY_UUID, &[0xA1, 0x88, 0x01, 0x2C, 0x00]);
        device.poll(t0 + 400 * MS).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), SinkEvent::Telemetry(s) if s.steps == 300));
        // answered, but the minimum gap has not passed
        assert_eq!(link.writes().len(), 1);

        device.poll(t0 + 600 * MS).await.unwrap();
        assert_eq!(
            link.writes(),
            vec![request(Opcode::Steps), request(Opcode::Status)]
        );
        assert_eq!(device.polling().cycle().index, 2);
    }

    #[tokio::test]
    async fn test_unanswered_request_is_forced_on() {
        let link = console_link();
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.poll(t0 + 300 * MS).await.unwrap();
        device.poll(t0 + 1_699 * MS).await.unwrap();
        assert_eq!(link.writes().len(), 1);

        device.poll(t0 + 1_700 * MS).await.unwrap();
        assert_eq!(
            link.writes(),
            vec![request(Opcode::Steps), request(Opcode::Status)]
        );
        assert_eq!(device.polling().cycle().consecutive_misses, 1);
    }

    #[tokio::test]
    async fn test_status_responses_drive_session() {
        let link = console_link();
        let (mut device, mut rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        // Steps, then Status
        device.poll(t0 + 300 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &[0xA1, 0x88, 0x00, 0x00, 0x00]);
        device.poll(t0 + 600 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &[0xA1, 0x91, 0x03, 0x00, 0x00]);

        // Duration, then Status again
        device.poll(t0 + 900 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &[0xA1, 0x89, 0x00, 0x01, 0x00]);
        device.poll(t0 + 1_200 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &[0xA1, 0x91, 0x03, 0x00, 0x00]);
        device.poll(t0 + 1_500 * MS).await.unwrap();

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&SinkEvent::Started));
        assert!(device.pipeline.is_active());
        assert_eq!(device.pipeline.telemetry().duration_seconds, 60);
    }

    #[tokio::test]
    async fn test_invalid_status_still_counts_as_response() {
        let link = console_link();
        let (mut device, mut rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.poll(t0 + 300 * MS).await.unwrap();
        link.notify(NOTIFY_UUID, &[0xA1, 0x88, 0x00, 0x05, 0x00]);
        device.poll(t0 + 600 * MS).await.unwrap();
        while rx.try_recv().is_ok() {}

        link.notify(NOTIFY_UUID, &[0xA1, 0x91, 0x03, 0x01, 0x00]);
        device.poll(t0 + 700 * MS).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!device.polling().cycle().awaiting_response);
    }

    #[tokio::test]
    async fn test_reset_is_logged_only() {
        let link = console_link();
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.pipeline.request_reset();
        device.poll(t0 + 300 * MS).await.unwrap();
        assert_eq!(link.writes(), vec![request(Opcode::Steps)]);
    }

    #[tokio::test]
    async fn test_link_loss_restarts_rotation() {
        let link = console_link();
        let (mut device, _rx) = device(&link);
        let t0 = Instant::now();
        connect(&mut device, &link, t0).await;

        device.poll(t0 + 300 * MS).await.unwrap();
        assert_eq!(device.polling().cycle().index, 1);

        link.drop_link();
        device.poll(t0 + 400 * MS).await.unwrap();
        assert!(!device.is_connected());
        assert_eq!(device.polling().cycle().index, 0);
        assert_eq!(device.polling().last_sent_opcode(), None);
    }
}
