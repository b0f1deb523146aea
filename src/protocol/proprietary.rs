use btleplug::api::bleuuid::uuid_from_u16;
use bytes::Buf;
use tracing::warn;
use uuid::Uuid;

use super::{ensure_len, Decoder};
use crate::{
    error::DecodeError,
    types::{DecodedFrame, SpeedUnit, StatusSignal, TelemetryUpdate},
};

/// Vendor service carrying the notify stream
pub const SERVICE_UUID: Uuid = uuid_from_u16(0xFFF0);
/// Notify characteristic
pub const NOTIFY_UUID: Uuid = uuid_from_u16(0xFFF1);
/// Write characteristic
pub const WRITE_UUID: Uuid = uuid_from_u16(0xFFF2);

/// Command that (re)starts the notify stream
pub const START_STREAM: [u8; 4] = [0x02, 0x51, 0x0B, 0x03];

/// First byte of every frame
pub const SYNC: u8 = 0x02;
/// Second byte of a data frame
pub const SUB_ID: u8 = 0x51;

/// Shortest frame that still carries status and speed
pub const MIN_LEN: usize = 6;

const STATUS_IDX: usize = 2;
const SPEED_IDX: usize = 3;
const DURATION_IDX: usize = 5;
const DISTANCE_IDX: usize = 7;
const STEPS_IDX: usize = 11;

/// Meters per tenth of a mile
const METERS_PER_TENTH_MILE: f32 = 16.0934 / 10.0;

/// Status byte meanings
pub mod status {
    /// Idle, display on
    pub const STANDBY: u8 = 0x00;
    /// Belt starting
    pub const STARTING: u8 = 0x02;
    /// Belt running
    pub const RUNNING: u8 = 0x03;
    /// Belt slowing down into a pause
    pub const PAUSING: u8 = 0x04;
    /// Display off
    pub const OFF: u8 = 0x06;
    /// Paused
    pub const PAUSED: u8 = 0x0A;
}

/// Notify stream decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct ProprietaryStream;

impl Decoder for ProprietaryStream {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        decode_frame(data)
    }
}

fn u16_at(data: &[u8], idx: usize) -> Option<u16> {
    data.get(idx..idx + 2).map(|mut bytes| bytes.get_u16_le())
}

/// Map the status byte to a signal
///
/// `PAUSING` yields `None`: the belt has not stopped yet and the previous
/// state holds.
#[must_use]
pub const fn status_signal(code: u8) -> Option<StatusSignal> {
    match code {
        status::STARTING | status::RUNNING => Some(StatusSignal::Running),
        status::PAUSING => None,
        status::STANDBY => Some(StatusSignal::Standby),
        status::PAUSED => Some(StatusSignal::Paused),
        _ => Some(StatusSignal::Stopped),
    }
}

/// Decode one notify frame
///
/// Layout (little endian): sync, sub-id, status, speed (0.1 mph), duration
/// (s), distance (0.1 mile), two unknown bytes, steps. Fields past byte 5 are
/// read only when the frame is long enough to hold them.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] below [`MIN_LEN`] bytes and
/// [`DecodeError::UnexpectedSync`] when byte 0 is not [`SYNC`].
pub fn decode_frame(data: &[u8]) -> Result<DecodedFrame, DecodeError> {
    ensure_len(data, MIN_LEN)?;
    if data[0] != SYNC {
        return Err(DecodeError::UnexpectedSync {
            expected: SYNC,
            got: data[0],
        });
    }
    if data[1] != SUB_ID {
        warn!("Unexpected sub-id {:#04X}, decoding anyway", data[1]);
    }

    let mut telemetry = TelemetryUpdate::default();

    if let Some(tenths) = u16_at(data, SPEED_IDX) {
        let mph = f32::from(tenths) / 10.0;
        telemetry.speed_kph = Some(SpeedUnit::Miles.to_kph(mph));
    }
    if let Some(seconds) = u16_at(data, DURATION_IDX) {
        telemetry.duration_seconds = Some(u32::from(seconds));
    }
    if let Some(tenths) = u16_at(data, DISTANCE_IDX) {
        telemetry.distance_meters = Some(f32::from(tenths) * METERS_PER_TENTH_MILE);
    }
    if let Some(steps) = u16_at(data, STEPS_IDX) {
        telemetry.steps = Some(u32::from(steps));
    }

    Ok(DecodedFrame {
        telemetry,
        status: status_signal(data[STATUS_IDX]),
    })
}
