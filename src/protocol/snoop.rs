use tracing::{debug, trace};

use super::{ensure_len, estimate_mph, Decoder};
use crate::{
    error::{DecodeError, Error, Result},
    types::{DecodedFrame, SpeedUnit, StatusSignal, TelemetryUpdate},
};

/// Capacity of each channel's ring buffer
pub const FRAME_CAPACITY: usize = 10;

/// Prefix of the console's step count request
pub const STEPS_REQUEST: [u8; 4] = [1, 3, 0, 15];
/// Prefix of the console's speed command
pub const SPEED_REQUEST: [u8; 4] = [1, 6, 0, 10];

/// Speed value the motor controller reports with the belt at rest
///
/// Calibrated on one console; values below it are line noise.
pub const SPEED_AT_REST: u16 = 50;

const SPEED_GATE: u8 = 10;

/// Bytes accumulated from one channel since the last clear
///
/// Writes wrap at [`FRAME_CAPACITY`]; the first four bytes are kept aside for
/// prefix matching.
#[derive(Debug, Clone, Default)]
pub struct SnoopFrame {
    bytes: [u8; FRAME_CAPACITY],
    head: [u8; 4],
    count: usize,
}

impl SnoopFrame {
    /// Append one byte
    pub fn push(&mut self, byte: u8) {
        if self.count < self.head.len() {
            self.head[self.count] = byte;
        }
        self.bytes[self.count % FRAME_CAPACITY] = byte;
        self.count += 1;
    }

    /// Bytes received since the last clear, including overwritten ones
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Check if nothing was received
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Buffer contents up to the received count
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.count.min(FRAME_CAPACITY)]
    }

    /// Check the first bytes received against a template
    #[must_use]
    pub fn starts_with(&self, template: &[u8]) -> bool {
        template.len() <= self.head.len()
            && self.count >= template.len()
            && self.head[..template.len()] == *template
    }

    /// Forget everything received
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Request classified by prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Step count query, answered on the response channel
    Steps,
    /// Speed command, carries its own value
    Speed,
    /// Anything else
    Other,
}

/// Classify a request frame against the known templates
#[must_use]
pub fn classify(frame: &SnoopFrame) -> RequestKind {
    if frame.starts_with(&STEPS_REQUEST) {
        RequestKind::Steps
    } else if frame.starts_with(&SPEED_REQUEST) {
        RequestKind::Speed
    } else {
        RequestKind::Other
    }
}

/// Speed command decoder (request channel)
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedRequest;

impl Decoder for SpeedRequest {
    /// Values below [`SPEED_AT_REST`] decode to an empty frame.
    fn decode(&self, data: &[u8]) -> std::result::Result<DecodedFrame, DecodeError> {
        ensure_len(data, 6)?;
        if data[3] != SPEED_GATE {
            return Ok(DecodedFrame::default());
        }
        let value = u16::from(data[4]) * 256 + u16::from(data[5]);

        let frame = match value.cmp(&SPEED_AT_REST) {
            std::cmp::Ordering::Less => DecodedFrame::default(),
            std::cmp::Ordering::Equal => DecodedFrame {
                telemetry: TelemetryUpdate {
                    speed_kph: Some(0.0),
                    ..Default::default()
                },
                status: Some(StatusSignal::Stopped),
            },
            std::cmp::Ordering::Greater => DecodedFrame {
                telemetry: TelemetryUpdate {
                    speed_kph: Some(SpeedUnit::Miles.to_kph(estimate_mph(value))),
                    ..Default::default()
                },
                status: Some(StatusSignal::Running),
            },
        };
        Ok(frame)
    }
}

/// Step count response decoder (response channel)
#[derive(Debug, Clone, Copy, Default)]
pub struct StepsResponse;

impl Decoder for StepsResponse {
    fn decode(&self, data: &[u8]) -> std::result::Result<DecodedFrame, DecodeError> {
        ensure_len(data, 5)?;
        let steps = u32::from(data[3]) * 256 + u32::from(data[4]);
        Ok(DecodedFrame::telemetry(TelemetryUpdate {
            steps: Some(steps),
            ..Default::default()
        }))
    }
}

/// Pairs observed requests with their responses
#[derive(Debug, Clone)]
pub struct SnoopDecoder {
    last_request: RequestKind,
}

impl Default for SnoopDecoder {
    fn default() -> Self {
        Self {
            last_request: RequestKind::Other,
        }
    }
}

impl SnoopDecoder {
    /// Create a decoder with no pending request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of the last request seen
    #[must_use]
    pub const fn last_request(&self) -> RequestKind {
        self.last_request
    }

    /// Handle a complete request frame
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when a speed command is cut short.
    pub fn on_request(
        &mut self,
        frame: &SnoopFrame,
    ) -> std::result::Result<DecodedFrame, DecodeError> {
        trace!("REQ: {:?}", frame.as_slice());
        self.last_request = classify(frame);
        match self.last_request {
            RequestKind::Speed => SpeedRequest.decode(frame.as_slice()),
            RequestKind::Steps | RequestKind::Other => Ok(DecodedFrame::default()),
        }
    }

    /// Handle a complete response frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when no step request preceded the response
    /// and [`Error::Decode`] when the response is too short.
    pub fn on_response(&mut self, frame: &SnoopFrame) -> Result<DecodedFrame> {
        trace!("RESP: {:?}", frame.as_slice());
        let paired = std::mem::replace(&mut self.last_request, RequestKind::Other);
        if paired != RequestKind::Steps {
            return Err(Error::Protocol(format!(
                "response of {} bytes without a step request",
                frame.count()
            )));
        }
        let decoded = StepsResponse.decode(frame.as_slice())?;
        debug!("Steps: {:?}", decoded.telemetry.steps);
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(bytes: &[u8]) -> SnoopFrame {
        let mut frame = SnoopFrame::default();
        for b in bytes {
            frame.push(*b);
        }
        frame
    }

    #[test]
    fn test_steps_pairing() {
        let mut decoder = SnoopDecoder::new();

        let request = decoder.on_request(&frame_of(&[1, 3, 0, 15, 0, 0])).unwrap();
        assert!(request.telemetry.is_empty());
        assert_eq!(decoder.last_request(), RequestKind::Steps);

        let response = decoder.on_response(&frame_of(&[1, 3, 2, 1, 44, 0])).unwrap();
        assert_eq!(response.telemetry.steps, Some(300));
        assert_eq!(decoder.last_request(), RequestKind::Other);
    }

    #[test]
    fn test_unpaired_response_rejected() {
        let mut decoder = SnoopDecoder::new();
        decoder.on_request(&frame_of(&[9, 9, 9, 9])).unwrap();

        let err = decoder.on_response(&frame_of(&[1, 3, 2, 1, 44])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_truncated_steps_response() {
        let mut decoder = SnoopDecoder::new();
        decoder.on_request(&frame_of(&STEPS_REQUEST)).unwrap();

        let err = decoder.on_response(&frame_of(&[1, 3, 2])).unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(DecodeError::Truncated { needed: 5, got: 3 })
        ));
    }

    #[test]
    fn test_speed_command() {
        let mut decoder = SnoopDecoder::new();

        let at_rest = decoder.on_request(&frame_of(&[1, 6, 0, 10, 0, 50])).unwrap();
        assert_eq!(at_rest.status, Some(StatusSignal::Stopped));
        assert_eq!(at_rest.telemetry.speed_kph, Some(0.0));

        let moving = decoder.on_request(&frame_of(&[1, 6, 0, 10, 1, 244])).unwrap();
        assert_eq!(moving.status, Some(StatusSignal::Running));
        assert!((moving.telemetry.speed_kph.unwrap() - 3.486).abs() < 0.01);

        let noise = decoder.on_request(&frame_of(&[1, 6, 0, 10, 0, 12])).unwrap();
        assert_eq!(noise, DecodedFrame::default());
    }

    #[test]
    fn test_speed_gate_byte() {
        assert_eq!(
            SpeedRequest.decode(&[1, 6, 0, 11, 1, 244]).unwrap(),
            DecodedFrame::default()
        );
        assert!(matches!(
            SpeedRequest.decode(&[1, 6, 0, 10, 1]),
            Err(DecodeError::Truncated { needed: 6, got: 5 })
        ));
    }

    #[test]
    fn test_ring_wraps() {
        let mut frame = frame_of(&[1, 3, 0, 15, 4, 5, 6, 7, 8, 9, 10, 11]);

        assert_eq!(frame.count(), 12);
        assert_eq!(frame.as_slice(), &[10, 11, 0, 15, 4, 5, 6, 7, 8, 9]);
        // prefix survives the wrap
        assert_eq!(classify(&frame), RequestKind::Steps);

        frame.clear();
        assert!(frame.is_empty());
        assert_eq!(classify(&frame), RequestKind::Other);
    }

    #[test]
    fn test_short_frame_does_not_match() {
        assert_eq!(classify(&frame_of(&[1, 3, 0])), RequestKind::Other);
        assert_eq!(classify(&frame_of(&[1, 6, 0, 10])), RequestKind::Speed);
    }
}
