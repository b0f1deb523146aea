use btleplug::api::bleuuid::uuid_from_u16;
use bytes::Buf;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use super::{ensure_len, Decoder};
use crate::{
    error::DecodeError,
    types::{DecodedFrame, StatusSignal, TelemetryUpdate},
};

/// Fitness Machine service
pub const SERVICE_UUID: Uuid = uuid_from_u16(0x1826);
/// Treadmill Data characteristic (notify)
pub const TREADMILL_DATA_UUID: Uuid = uuid_from_u16(0x2ACD);
/// Fitness Machine Status characteristic (notify)
pub const MACHINE_STATUS_UUID: Uuid = uuid_from_u16(0x2ADA);
/// Fitness Machine Feature characteristic (read)
pub const FEATURE_UUID: Uuid = uuid_from_u16(0x2ACC);
/// Treadmill Feature characteristic (read)
pub const TREADMILL_FEATURE_UUID: Uuid = uuid_from_u16(0x2ACE);
/// Fitness Machine Control Point characteristic (write)
pub const CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2AD9);

/// Control point "request control" opcode
pub const REQUEST_CONTROL: [u8; 1] = [0x00];
/// Control point reset payload
pub const RESET: [u8; 2] = [0x08, 0x01];

/// Step estimate per meter of belt distance
///
/// Calibrated on a single unit (211 steps over 128.74 m, rounded up); the
/// data characteristic has no step field.
pub const STEPS_PER_METER: f32 = 1.7233;

/// Treadmill Data flag bits, in wire order
pub mod flags {
    /// Set when instantaneous speed is *absent*
    pub const MORE_DATA: u16 = 1 << 0;
    /// Average speed present
    pub const AVERAGE_SPEED: u16 = 1 << 1;
    /// Total distance present
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    /// Inclination present
    pub const INCLINATION: u16 = 1 << 3;
    /// Elevation gain present
    pub const ELEVATION_GAIN: u16 = 1 << 4;
    /// Instantaneous pace present
    pub const INSTANTANEOUS_PACE: u16 = 1 << 5;
    /// Average pace present
    pub const AVERAGE_PACE: u16 = 1 << 6;
    /// Expended energy present
    pub const EXPENDED_ENERGY: u16 = 1 << 7;
    /// Heart rate present
    pub const HEART_RATE: u16 = 1 << 8;
    /// Metabolic equivalent present
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 9;
    /// Elapsed time present
    pub const ELAPSED_TIME: u16 = 1 << 10;
    /// Remaining time present
    pub const REMAINING_TIME: u16 = 1 << 11;
    /// Force on belt present
    pub const FORCE_ON_BELT: u16 = 1 << 12;
    /// Power output present
    pub const POWER_OUTPUT: u16 = 1 << 13;
}

// (flag, width in bytes) in the order the fields follow the flags
const FIELDS: [(u16, usize); 14] = [
    (flags::MORE_DATA, 2),
    (flags::AVERAGE_SPEED, 2),
    (flags::TOTAL_DISTANCE, 3),
    (flags::INCLINATION, 2),
    (flags::ELEVATION_GAIN, 2),
    (flags::INSTANTANEOUS_PACE, 2),
    (flags::AVERAGE_PACE, 2),
    (flags::EXPENDED_ENERGY, 5),
    (flags::HEART_RATE, 1),
    (flags::METABOLIC_EQUIVALENT, 1),
    (flags::ELAPSED_TIME, 2),
    (flags::REMAINING_TIME, 2),
    (flags::FORCE_ON_BELT, 2),
    (flags::POWER_OUTPUT, 2),
];

const fn field_present(all: u16, flag: u16) -> bool {
    // bit 0 is inverted: speed follows when it is clear
    if flag == flags::MORE_DATA {
        all & flag == 0
    } else {
        all & flag != 0
    }
}

/// Length a Treadmill Data frame must have for the given flags
#[must_use]
pub fn expected_len(all: u16) -> usize {
    2 + FIELDS
        .iter()
        .filter(|(flag, _)| field_present(all, *flag))
        .map(|(_, width)| width)
        .sum::<usize>()
}

/// Treadmill Data (0x2ACD) decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct TreadmillData;

impl Decoder for TreadmillData {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        decode_treadmill_data(data)
    }
}

/// Decode a Treadmill Data notification
///
/// Fields follow the flag word in strict bit order, so the whole frame is
/// length-checked against the flags before any field is read.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] when the frame is shorter than its
/// flags imply.
pub fn decode_treadmill_data(data: &[u8]) -> Result<DecodedFrame, DecodeError> {
    ensure_len(data, 2)?;
    let mut buf = data;
    let all = buf.get_u16_le();
    ensure_len(data, expected_len(all))?;

    let mut update = TelemetryUpdate::default();

    if field_present(all, flags::MORE_DATA) {
        // 0.001 m/s resolution
        let raw = buf.get_u16_le();
        update.speed_kph = Some(f32::from(raw) * 0.0036);
    }
    if field_present(all, flags::AVERAGE_SPEED) {
        buf.advance(2);
    }
    if field_present(all, flags::TOTAL_DISTANCE) {
        let meters = u32::try_from(buf.get_uint_le(3)).unwrap_or(u32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let distance = meters as f32;
        update.distance_meters = Some(distance);
        if meters > 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let steps = (distance * STEPS_PER_METER) as u32;
            update.steps = Some(steps);
        }
    }
    if field_present(all, flags::INCLINATION) {
        let incline = buf.get_i16_le();
        debug!("Incline: {:.1}%", f32::from(incline) * 0.1);
    }
    if field_present(all, flags::ELEVATION_GAIN) {
        buf.advance(2);
    }
    if field_present(all, flags::INSTANTANEOUS_PACE) {
        buf.advance(2);
    }
    if field_present(all, flags::AVERAGE_PACE) {
        buf.advance(2);
    }
    if field_present(all, flags::EXPENDED_ENERGY) {
        let total = buf.get_u16_le();
        // per hour and per minute
        buf.advance(3);
        if total != u16::MAX {
            update.calories = Some(total);
        }
    }
    if field_present(all, flags::HEART_RATE) {
        let bpm = buf.get_u8();
        debug!("Heart rate: {} bpm", bpm);
    }
    if field_present(all, flags::METABOLIC_EQUIVALENT) {
        buf.advance(1);
    }
    if field_present(all, flags::ELAPSED_TIME) {
        let elapsed = buf.get_u16_le();
        if elapsed != 0 && elapsed != u16::MAX {
            update.duration_seconds = Some(u32::from(elapsed));
        }
    }
    if field_present(all, flags::REMAINING_TIME) {
        buf.advance(2);
    }
    if field_present(all, flags::FORCE_ON_BELT) {
        buf.advance(2);
    }
    if field_present(all, flags::POWER_OUTPUT) {
        let watts = buf.get_i16_le();
        debug!("Power output: {} W", watts);
    }

    if buf.has_remaining() {
        debug!("Extra bytes after treadmill data fields: {:02X?}", buf.chunk());
    }

    Ok(DecodedFrame::telemetry(update))
}

/// Fitness Machine Status (0x2ADA) decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineStatus;

impl Decoder for MachineStatus {
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        decode_machine_status(data)
    }
}

/// Decode a Fitness Machine Status notification
///
/// Only the start/stop opcodes carry run state; target changes and the like
/// decode to a frame without status.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] for an empty frame.
pub fn decode_machine_status(data: &[u8]) -> Result<DecodedFrame, DecodeError> {
    ensure_len(data, 1)?;
    let status = match data[0] {
        // stopped or paused by the user; some consoles send reset (0x02) instead
        0x02 | 0x03 => Some(StatusSignal::Stopped),
        // started or resumed
        0x04 => Some(StatusSignal::Running),
        other => {
            debug!("Machine status change ignored: {:#04X}", other);
            None
        }
    };
    Ok(DecodedFrame {
        telemetry: TelemetryUpdate::default(),
        status,
    })
}

/// Capabilities read from the Fitness Machine Feature characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitnessMachineFeatures {
    /// Fitness machine feature bits
    pub common: u32,
    /// Target setting feature bits
    pub target_settings: u32,
}

impl FitnessMachineFeatures {
    /// Decode the feature characteristic value
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when fewer than 4 bytes are present.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        ensure_len(data, 4)?;
        let mut buf = data;
        let common = buf.get_u32_le();
        let target_settings = if buf.remaining() >= 4 {
            buf.get_u32_le()
        } else {
            0
        };
        Ok(Self {
            common,
            target_settings,
        })
    }

    /// Average speed supported
    #[must_use]
    pub const fn average_speed(&self) -> bool {
        self.common & (1 << 0) != 0
    }

    /// Total distance supported
    #[must_use]
    pub const fn total_distance(&self) -> bool {
        self.common & (1 << 2) != 0
    }

    /// Inclination supported
    #[must_use]
    pub const fn inclination(&self) -> bool {
        self.common & (1 << 3) != 0
    }

    /// Step count supported
    #[must_use]
    pub const fn step_count(&self) -> bool {
        self.common & (1 << 6) != 0
    }

    /// Expended energy supported
    #[must_use]
    pub const fn expended_energy(&self) -> bool {
        self.common & (1 << 9) != 0
    }

    /// Heart rate measurement supported
    #[must_use]
    pub const fn heart_rate(&self) -> bool {
        self.common & (1 << 10) != 0
    }

    /// Elapsed time supported
    #[must_use]
    pub const fn elapsed_time(&self) -> bool {
        self.common & (1 << 12) != 0
    }

    /// Speed target setting supported
    #[must_use]
    pub const fn speed_target_setting(&self) -> bool {
        self.target_settings & (1 << 0) != 0
    }
}

impl fmt::Display for FitnessMachineFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        write!(
            f,
            "avg speed: {}, distance: {}, incline: {}, steps: {}, energy: {}, heart rate: {}, elapsed time: {}, speed target: {}",
            yes_no(self.average_speed()),
            yes_no(self.total_distance()),
            yes_no(self.inclination()),
            yes_no(self.step_count()),
            yes_no(self.expended_energy()),
            yes_no(self.heart_rate()),
            yes_no(self.elapsed_time()),
            yes_no(self.speed_target_setting()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_only_frame() {
        let frame = decode_treadmill_data(&[0x00, 0x00, 0x58, 0x02]).unwrap();

        let speed = frame.telemetry.speed_kph.unwrap();
        assert!((speed - 2.16).abs() < 1e-4);
        assert_eq!(expected_len(0x0000), 4);
        assert!(frame.status.is_none());
        assert_eq!(
            frame.telemetry,
            TelemetryUpdate {
                speed_kph: frame.telemetry.speed_kph,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_speed_bit_inverted() {
        // bit 0 set: no speed, flags only
        let frame = decode_treadmill_data(&[0x01, 0x00]).unwrap();
        assert!(frame.telemetry.is_empty());
    }

    #[test]
    fn test_distance_energy_met_frame() {
        // Flags 0x0484: distance, energy, elapsed time; speed present
        let data = [
            0x84, 0x04, 0x1E, 0x00, 0x1E, 0x00, 0x00, 0x02, 0x00, 0xFF, 0xFF, 0xFF, 0xA2, 0x00,
        ];
        let frame = decode_treadmill_data(&data).unwrap();

        let t = frame.telemetry;
        assert!((t.speed_kph.unwrap() - 0.108).abs() < 1e-4);
        assert!((t.distance_meters.unwrap() - 30.0).abs() < f32::EPSILON);
        assert_eq!(t.steps, Some(51));
        assert_eq!(t.calories, Some(2));
        assert_eq!(t.duration_seconds, Some(162));
    }

    #[test]
    fn test_full_field_walk() {
        // Flags 0x2585: no speed; distance, energy, heart rate, elapsed time, power
        let data = [
            0x85, 0x25, 0x01, 0x01, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x8B, 0xFA, 0x00, 0x00,
            0x00,
        ];
        let frame = decode_treadmill_data(&data).unwrap();

        let t = frame.telemetry;
        assert!(t.speed_kph.is_none());
        assert!((t.distance_meters.unwrap() - 257.0).abs() < f32::EPSILON);
        assert_eq!(t.calories, Some(20));
        assert_eq!(t.duration_seconds, Some(250));
    }

    #[test]
    fn test_zero_distance_has_no_step_estimate() {
        let frame = decode_treadmill_data(&[0x05, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frame.telemetry.distance_meters, Some(0.0));
        assert_eq!(frame.telemetry.steps, None);
    }

    #[test]
    fn test_unavailable_fields_skipped() {
        // energy 0xFFFF and elapsed 0xFFFF are "not available"
        let data = [
            0x81, 0x04, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ];
        let frame = decode_treadmill_data(&data).unwrap();
        assert!(frame.telemetry.is_empty());
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            decode_treadmill_data(&[0x00]),
            Err(DecodeError::Truncated { needed: 2, got: 1 })
        );
        assert_eq!(
            decode_treadmill_data(&[0x00, 0x00, 0x58]),
            Err(DecodeError::Truncated { needed: 4, got: 3 })
        );
        // distance flag set but only two distance bytes
        assert_eq!(
            decode_treadmill_data(&[0x05, 0x00, 0x10, 0x00]),
            Err(DecodeError::Truncated { needed: 5, got: 4 })
        );
    }

    #[test]
    fn test_machine_status() {
        let running = decode_machine_status(&[0x04]).unwrap();
        assert_eq!(running.status, Some(StatusSignal::Running));

        let stopped = decode_machine_status(&[0x02, 0x01]).unwrap();
        assert_eq!(stopped.status, Some(StatusSignal::Stopped));
        assert_eq!(
            decode_machine_status(&[0x03]).unwrap().status,
            Some(StatusSignal::Stopped)
        );

        let speed_changed = decode_machine_status(&[0x05, 0x10, 0x0E]).unwrap();
        assert!(speed_changed.status.is_none());

        assert!(matches!(
            MachineStatus.decode(&[]),
            Err(DecodeError::Truncated { needed: 1, got: 0 })
        ));
    }

    #[test]
    fn test_features() {
        let features =
            FitnessMachineFeatures::parse(&[0x45, 0x16, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00])
                .unwrap();

        assert!(features.average_speed());
        assert!(features.total_distance());
        assert!(features.step_count());
        assert!(features.expended_energy());
        assert!(features.heart_rate());
        assert!(features.elapsed_time());
        assert!(!features.inclination());
        assert!(features.speed_target_setting());
        assert!(features.to_string().contains("steps: yes"));

        let short = FitnessMachineFeatures::parse(&[0x04, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(short.target_settings, 0);
        assert!(FitnessMachineFeatures::parse(&[0x04]).is_err());
    }
}
