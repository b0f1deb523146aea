use thiserror::Error;
use uuid::Uuid;

/// Reasons a single inbound frame could not be decoded
///
/// Decode errors are always local to one frame: the frame is dropped and the
/// telemetry and session state of the device stay untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than its header or flags require
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated {
        /// Minimum length the frame needed
        needed: usize,
        /// Length actually received
        got: usize,
    },

    /// Status response with non-zero trailing bytes, likely corrupted or misrouted
    #[error("invalid status frame")]
    InvalidStatusFrame,

    /// First byte is not the expected sync byte
    #[error("unexpected sync byte {got:02X} (expected {expected:02X})")]
    UnexpectedSync {
        /// Expected sync byte
        expected: u8,
        /// Sync byte received
        got: u8,
    },
}

/// Errors raised by the connectivity layer
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth Low Energy stack errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Scan, connect or write failure reported by the link
    #[error("Transport error: {0}")]
    Transport(String),

    /// Required GATT service missing on the peer
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    /// Required GATT characteristic missing on the peer
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Another device currently owns the radio for scanning
    #[error("Scan already in progress for another device")]
    ScanBusy,

    /// Frame decoding failure
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Response arrived with no matching outstanding request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for connectivity operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error comes from the scan/connect/discover/subscribe path
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Transport(_)
                | Self::ServiceNotFound(_)
                | Self::CharacteristicNotFound(_)
                | Self::ScanBusy
        )
    }

    /// Check if this error only affects a single frame
    #[must_use]
    pub const fn is_frame_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Protocol(_))
    }

    /// Check if the poll loop can carry on after this error
    ///
    /// Only configuration and local IO problems need the caller's attention;
    /// everything the peripheral can cause is recovered by retrying.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Io(_))
    }
}
