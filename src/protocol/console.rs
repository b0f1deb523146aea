use btleplug::api::bleuuid::uuid_from_u16;
use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use super::{ensure_len, estimate_mph, Decoder, METERS_PER_HUNDREDTH_MILE};
use crate::{
    error::DecodeError,
    types::{DecodedFrame, SpeedUnit, StatusSignal, TelemetryUpdate},
};

/// Advertised name prefix of the console
pub const NAME_PREFIX: &str = "LifeSpan-TM";

/// Console service
pub const SERVICE_UUID: Uuid = uuid_from_u16(0xFFF0);
/// Response characteristic (notify)
pub const NOTIFY_UUID: Uuid = uuid_from_u16(0xFFF1);
/// Request characteristic (write)
pub const WRITE_UUID: Uuid = uuid_from_u16(0xFFF2);

/// First byte of every request frame
pub const REQUEST_HEADER: u8 = 0xA1;

/// Console query opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Belt speed
    Speed = 0x82,
    /// Distance walked
    Distance = 0x85,
    /// Energy expended
    Calories = 0x87,
    /// Step count
    Steps = 0x88,
    /// Workout duration
    Duration = 0x89,
    /// Console run state
    Status = 0x91,
}

impl Opcode {
    /// Wire value
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Request frame querying this opcode
    #[must_use]
    pub const fn request(self) -> [u8; 6] {
        [REQUEST_HEADER, self.code(), 0, 0, 0, 0]
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speed => write!(f, "SPEED"),
            Self::Distance => write!(f, "DISTANCE"),
            Self::Calories => write!(f, "CALORIES"),
            Self::Steps => write!(f, "STEPS"),
            Self::Duration => write!(f, "DURATION"),
            Self::Status => write!(f, "STATUS"),
        }
    }
}

/// Rotation of queried opcodes; status and steps are polled most often
pub const POLL_ORDER: [Opcode; 10] = [
    Opcode::Steps,
    Opcode::Status,
    Opcode::Duration,
    Opcode::Status,
    Opcode::Distance,
    Opcode::Steps,
    Opcode::Status,
    Opcode::Calories,
    Opcode::Status,
    Opcode::Speed,
];

/// Console status codes
pub mod status {
    /// Idle
    pub const STANDBY: u8 = 1;
    /// Belt running
    pub const RUNNING: u8 = 3;
    /// Workout summary shown
    pub const SUMMARY_SCREEN: u8 = 4;
    /// Paused
    pub const PAUSED: u8 = 5;
}

/// Map a console status code to a signal
#[must_use]
pub const fn status_signal(code: u8) -> StatusSignal {
    match code {
        status::RUNNING => StatusSignal::Running,
        status::PAUSED => StatusSignal::Paused,
        status::SUMMARY_SCREEN => StatusSignal::Stopped,
        status::STANDBY => StatusSignal::Standby,
        other => StatusSignal::Unknown(other),
    }
}

/// Decoder for a response to a known opcode
///
/// Responses do not name the opcode they answer, so the decoder is built
/// from the last request sent.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleResponse {
    /// Opcode the response answers
    pub opcode: Opcode,
}

impl Decoder for ConsoleResponse {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        decode_response(self.opcode, data)
    }
}

fn be_value(data: &[u8]) -> Result<u16, DecodeError> {
    ensure_len(data, 4)?;
    let mut buf = &data[2..];
    Ok(buf.get_u16())
}

/// Decode a response paired with the opcode that requested it
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] when the value bytes are missing and
/// [`DecodeError::InvalidStatusFrame`] when a status response has non-zero
/// padding.
pub fn decode_response(opcode: Opcode, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let mut telemetry = TelemetryUpdate::default();

    match opcode {
        Opcode::Steps => {
            telemetry.steps = Some(u32::from(be_value(data)?));
        }
        Opcode::Distance => {
            let hundredths = be_value(data)?;
            telemetry.distance_meters = Some(f32::from(hundredths) * METERS_PER_HUNDREDTH_MILE);
        }
        Opcode::Calories => {
            telemetry.calories = Some(be_value(data)?);
        }
        Opcode::Speed => {
            let raw = be_value(data)?;
            let mph = estimate_mph(raw).max(0.0);
            debug!("Speed: {} => {:.1} mph", raw, mph);
            telemetry.speed_kph = Some(SpeedUnit::Miles.to_kph(mph));
        }
        Opcode::Duration => {
            ensure_len(data, 5)?;
            let (hours, minutes, seconds) = (data[2], data[3], data[4]);
            debug!("Duration: {}:{:02}:{:02}", hours, minutes, seconds);
            telemetry.duration_seconds =
                Some(u32::from(hours) * 3_600 + u32::from(minutes) * 60 + u32::from(seconds));
        }
        Opcode::Status => {
            ensure_len(data, 5)?;
            if data[3] != 0 || data[4] != 0 {
                return Err(DecodeError::InvalidStatusFrame);
            }
            return Ok(DecodedFrame::status(status_signal(data[2])));
        }
    }

    Ok(DecodedFrame::telemetry(telemetry))
}
