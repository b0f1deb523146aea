use std::{io, sync::Arc, time::Instant};
use tracing::{debug, info, warn};

use super::Pipeline;
use crate::{
    bus::{Bus, ByteChannel},
    config::DeviceConfig,
    error::{Error, Result},
    protocol::snoop::{SnoopDecoder, SnoopFrame},
    session::SessionSink,
};

/// Console observed on its wired bus
///
/// Nothing is ever sent. Requests from the console are classified by prefix;
/// a response is only decoded when it follows a step count request.
#[derive(Debug)]
pub struct SnoopDevice {
    pub(crate) pipeline: Pipeline,
    bus: Bus,
    request: SnoopFrame,
    response: SnoopFrame,
    decoder: SnoopDecoder,
}

/// Move every available byte of `channel` into `frame`
fn drain_channel(channel: &mut dyn ByteChannel, frame: &mut SnoopFrame) -> io::Result<bool> {
    let mut received = false;
    while channel.available() > 0 {
        match channel.read_byte() {
            Ok(byte) => {
                frame.push(byte);
                received = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(received)
}

impl SnoopDevice {
    /// Create a device listening on `bus`
    #[must_use]
    pub fn new(config: &DeviceConfig, bus: Bus, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            pipeline: Pipeline::new(config, sink),
            bus,
            request: SnoopFrame::default(),
            response: SnoopFrame::default(),
            decoder: SnoopDecoder::new(),
        }
    }

    /// The bus has no link to lose
    #[must_use]
    #[allow(clippy::unused_self)]
    pub const fn is_connected(&self) -> bool {
        true
    }

    /// Read both lines and decode whatever arrived
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when a line fails to read. Malformed and
    /// unpaired frames are logged and dropped.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        let drained = drain_channel(self.bus.request.as_mut(), &mut self.request)
            .and_then(|got_request| {
                let got_response =
                    drain_channel(self.bus.response.as_mut(), &mut self.response)?;
                Ok((got_request, got_response))
            });
        let (got_request, got_response) = match drained {
            Ok(got) => got,
            Err(e) => {
                // partial bytes would shift the next frame off its prefix
                self.request.clear();
                self.response.clear();
                return Err(e.into());
            }
        };

        if got_request {
            match self.decoder.on_request(&self.request) {
                Ok(frame) => {
                    self.pipeline.apply(&frame, now);
                }
                Err(e) => warn!(
                    "{}: dropped request {:?}: {}",
                    self.pipeline.name(),
                    self.request.as_slice(),
                    e
                ),
            }
            self.request.clear();
        }

        if got_response {
            match self.decoder.on_response(&self.response) {
                Ok(frame) => {
                    self.pipeline.apply(&frame, now);
                }
                Err(Error::Protocol(reason)) => debug!("{}: {}", self.pipeline.name(), reason),
                Err(e) => warn!(
                    "{}: dropped response {:?}: {}",
                    self.pipeline.name(),
                    self.response.as_slice(),
                    e
                ),
            }
            self.response.clear();
        }

        if self.pipeline.reset_due(now) {
            info!("{}: reset due, bus is listen-only", self.pipeline.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::MemoryChannel,
        session::{ChannelSink, SinkEvent},
    };
    use std::collections::VecDeque;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct BrokenLine;

    /// Serves its bytes but fails once after `fail_at` reads
    struct FlakyLine {
        bytes: VecDeque<u8>,
        fail_at: Option<usize>,
    }

    impl ByteChannel for FlakyLine {
        fn available(&self) -> usize {
            self.bytes.len()
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            match self.fail_at {
                Some(0) => {
                    self.fail_at = None;
                    Err(io::Error::new(io::ErrorKind::InvalidData, "framing error"))
                }
                _ => {
                    self.fail_at = self.fail_at.map(|n| n - 1);
                    self.bytes
                        .pop_front()
                        .ok_or_else(|| io::ErrorKind::WouldBlock.into())
                }
            }
        }
    }

    impl ByteChannel for BrokenLine {
        fn available(&self) -> usize {
            1
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "uart gone"))
        }
    }

    fn device() -> (
        SnoopDevice,
        MemoryChannel,
        MemoryChannel,
        UnboundedReceiver<SinkEvent>,
    ) {
        let (request, response) = (MemoryChannel::new(), MemoryChannel::new());
        let (sink, rx) = ChannelSink::channel();
        let device = SnoopDevice::new(
            &DeviceConfig::named("retro"),
            Bus::new(Box::new(request.clone()), Box::new(response.clone())),
            Arc::new(sink),
        );
        (device, request, response, rx)
    }

    #[test]
    fn test_steps_request_and_response() {
        let (mut device, request, response, mut rx) = device();
        let now = Instant::now();

        request.feed(&[1, 3, 0, 15, 0, 0]);
        response.feed(&[1, 3, 2, 1, 44, 0]);
        device.poll(now).unwrap();

        assert!(matches!(rx.try_recv().unwrap(), SinkEvent::Telemetry(s) if s.steps == 300));
        assert!(device.is_connected());
    }

    #[test]
    fn test_response_needs_preceding_request() {
        let (mut device, request, response, mut rx) = device();
        let now = Instant::now();

        response.feed(&[1, 3, 2, 1, 44]);
        device.poll(now).unwrap();
        assert!(rx.try_recv().is_err());

        // a request in an earlier tick pairs with the next response
        request.feed(&[1, 3, 0, 15]);
        device.poll(now).unwrap();
        response.feed(&[1, 3, 2, 0, 7]);
        device.poll(now).unwrap();
        assert_eq!(device.pipeline.telemetry().steps, 7);
    }

    #[test]
    fn test_speed_commands_drive_session() {
        let (mut device, request, _response, mut rx) = device();
        let now = Instant::now();

        for _ in 0..2 {
            request.feed(&[1, 6, 0, 10, 1, 244]);
            device.poll(now).unwrap();
        }
        assert!(matches!(rx.try_recv().unwrap(), SinkEvent::Telemetry(_)));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Started);

        for _ in 0..2 {
            request.feed(&[1, 6, 0, 10, 0, 50]);
            device.poll(now).unwrap();
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            SinkEvent::Telemetry(s) if s.speed_kph == Some(0.0)
        ));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Ended);
        assert!(!device.pipeline.is_active());
    }

    #[test]
    fn test_noise_below_rest_value_is_ignored() {
        let (mut device, request, _response, mut rx) = device();

        request.feed(&[1, 6, 0, 10, 0, 12]);
        device.poll(Instant::now()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_read_failure_propagates() {
        let (sink, _rx) = ChannelSink::channel();
        let mut device = SnoopDevice::new(
            &DeviceConfig::named("retro"),
            Bus::new(Box::new(BrokenLine), Box::new(MemoryChannel::new())),
            Arc::new(sink),
        );

        let err = device.poll(Instant::now()).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_read_failure_discards_partial_frames() {
        let (sink, mut rx) = ChannelSink::channel();
        let line = FlakyLine {
            bytes: VecDeque::from(vec![1, 3, 0, 1, 6, 0, 10, 1, 244]),
            fail_at: Some(3),
        };
        let mut device = SnoopDevice::new(
            &DeviceConfig::named("retro"),
            Bus::new(Box::new(line), Box::new(MemoryChannel::new())),
            Arc::new(sink),
        );
        let now = Instant::now();

        assert!(device.poll(now).is_err());
        assert!(device.request.is_empty());
        assert!(device.response.is_empty());

        device.poll(now).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SinkEvent::Telemetry(s) if s.speed_kph.is_some_and(|kph| kph > 0.0)
        ));
    }
}
