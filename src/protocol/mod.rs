//! Frame decoders for the four supported console formats
//!
//! Every decoder is a pure function of its input bytes (plus, for the polling
//! console, the opcode the response answers). Decoders report malformed
//! frames as [`DecodeError`]s and never raise session events themselves; the
//! `status` of the returned [`DecodedFrame`] feeds the session detector.

use crate::{error::DecodeError, types::DecodedFrame};

/// Request/response opcode console
pub mod console;
/// Standards-based fitness machine service
pub mod ftms;
/// Proprietary notify stream layered on the fitness machine service
pub mod proprietary;
/// Passive two-wire serial bus observation
pub mod snoop;

/// Meters in a hundredth of a mile
pub const METERS_PER_HUNDREDTH_MILE: f32 = 16.0934;

/// Common decoder contract
pub trait Decoder {
    /// Decode one frame
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the frame is truncated or malformed.
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError>;
}

/// Estimate belt speed in mph from the raw console speed register
///
/// Linear fit against the console display; only meaningful for the
/// opcode and serial consoles.
#[must_use]
pub fn estimate_mph(raw: u16) -> f32 {
    0.004_35f32.mul_add(f32::from(raw), -0.009)
}

pub(crate) const fn ensure_len(data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        Err(DecodeError::Truncated {
            needed,
            got: data.len(),
        })
    } else {
        Ok(())
    }
}
