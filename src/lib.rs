#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Treadsync 🏃
//!
//! Connects to treadmill consoles, decodes their workout telemetry and turns
//! their run state into "session started" / "session ended" events for a
//! workout recorder.
//!
//! Four kinds of console are supported:
//!
//! - **Fitness Machine Service**: the standard BLE treadmill profile
//!   (Treadmill Data, Machine Status, Control Point)
//! - **Proprietary stream**: a vendor notify stream that has to be started
//!   with a write, next to a fitness machine service used for resets
//! - **Polling console**: answers one opcode query at a time over a vendor
//!   service, matched by its advertised name
//! - **Serial snoop**: a wired console whose bus between console and motor
//!   controller is only listened to
//!
//! Every device is a poll-driven state machine. A [`Scheduler`] ticks all of
//! them; BLE devices scan, connect and subscribe through a [`Link`], decode
//! whatever notification arrived since the last tick, debounce the run state
//! and publish to a [`SessionSink`]. After a session ends the console is reset
//! so the next workout starts from zero.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use treadsync::{BtleplugLink, FtmsDevice, SessionRecorder, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = Arc::new(BtleplugLink::new().await?);
//!     let recorder = Arc::new(SessionRecorder::new());
//!
//!     let mut scheduler = Scheduler::default();
//!     scheduler.add(FtmsDevice::new(
//!         &FtmsDevice::default_config("treadmill"),
//!         link,
//!         scheduler.arbiter(),
//!         recorder.clone(),
//!     ));
//!     scheduler.run_until(tokio::signal::ctrl_c()).await;
//!
//!     for session in recorder.sessions() {
//!         println!("{} steps in {} s", session.steps, session.duration_seconds());
//!     }
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy link over btleplug
pub mod ble;
/// Wired bus capability for the serial snoop variant
pub mod bus;
/// Device configuration
pub mod config;
/// Scan and connect state machine
pub mod connection;
/// Treadmill device variants
pub mod device;
/// Error types and handling
pub mod error;
/// Link capability shared by the BLE devices
pub mod link;
/// Opcode rotation for request/response consoles
pub mod polling;
/// Protocol decoders
pub mod protocol;
/// In-memory workout log
pub mod recorder;
/// Delayed console reset
pub mod reset;
/// Cooperative tick loop
pub mod scheduler;
/// Session detection and event sinks
pub mod session;
/// Interval timer
pub mod timer;
/// Type definitions and data structures
pub mod types;

pub use ble::BtleplugLink;
pub use bus::{Bus, ByteChannel, MemoryChannel};
pub use config::{ConnectionConfig, DetectorConfig, DeviceConfig, PollingConfig, ResetConfig};
pub use connection::{ConnectionState, ConnectionStateMachine};
pub use device::{ConsoleDevice, DeviceKind, FtmsDevice, ProprietaryDevice, SnoopDevice};
pub use error::{DecodeError, Error, Result};
pub use link::{Link, ScanArbiter, ScanFilter};
pub use recorder::{SessionRecorder, WorkoutSession};
pub use scheduler::Scheduler;
pub use session::{ChannelSink, LogSink, SessionDetector, SessionSink, SinkEvent};
pub use types::{
    Advertisement, DecodedFrame, PeerAddress, SessionEvent, SpeedUnit, StatusSignal,
    TelemetrySample, TelemetryUpdate,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
