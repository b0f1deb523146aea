use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Scan and reconnect timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Delay between connection attempts while disconnected
    pub retry_interval_ms: u64,
    /// Delay between a scan match and the connect attempt
    pub found_connect_delay_ms: u64,
    /// Length of one scan window
    pub scan_window_ms: u64,
    /// Wait before retrying when another device owns the scanner
    pub arbiter_backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5_000,
            found_connect_delay_ms: 100,
            scan_window_ms: 3_000,
            arbiter_backoff_ms: 500,
        }
    }
}

impl ConnectionConfig {
    /// Retry interval as a duration
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Scan window as a duration
    #[must_use]
    pub const fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }
}

/// Opcode polling cadence for request/response consoles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Minimum gap between commands once a response arrived
    pub min_interval_ms: u64,
    /// Gap after which the next command is sent even without a response
    pub max_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 300,
            max_interval_ms: 1_400,
        }
    }
}

/// Reset command timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Delay between session end and the reset command
    pub delay_after_session_end_ms: u64,
    /// Delay between a control point reset and the stream restart command
    pub stream_restart_delay_ms: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            delay_after_session_end_ms: 5_000,
            stream_restart_delay_ms: 1_000,
        }
    }
}

/// Session detection debounce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Repeats of the same status needed after the first observation
    pub confirmations: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { confirmations: 1 }
    }
}

/// Complete configuration of one device instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name used in log lines
    pub name: String,
    /// Scan and reconnect timing
    pub connection: ConnectionConfig,
    /// Opcode polling cadence
    pub polling: PollingConfig,
    /// Reset command timing
    pub reset: ResetConfig,
    /// Session detection debounce
    pub detector: DetectorConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "treadmill".to_string(),
            connection: ConnectionConfig::default(),
            polling: PollingConfig::default(),
            reset: ResetConfig::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Default configuration with a custom log name
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Check that the timing values are coherent
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an interval is zero or the polling
    /// bounds are inverted.
    pub fn validate(&self) -> Result<()> {
        if self.connection.retry_interval_ms == 0 {
            return Err(Error::Config("retry interval must be non-zero".to_string()));
        }
        if self.connection.scan_window_ms == 0 {
            return Err(Error::Config("scan window must be non-zero".to_string()));
        }
        if self.polling.max_interval_ms < self.polling.min_interval_ms {
            return Err(Error::Config(format!(
                "polling max interval {}ms is below min interval {}ms",
                self.polling.max_interval_ms, self.polling.min_interval_ms
            )));
        }
        Ok(())
    }
}
