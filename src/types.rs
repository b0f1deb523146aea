use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kilometers in one statute mile
pub const KM_PER_MILE: f32 = 1.609_34;

/// Speed unit reported by a console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedUnit {
    /// Kilometers per hour
    Kilometers,
    /// Miles per hour
    Miles,
}

impl SpeedUnit {
    /// Convert a speed expressed in this unit to km/h
    #[must_use]
    pub fn to_kph(self, value: f32) -> f32 {
        match self {
            Self::Kilometers => value,
            Self::Miles => value * KM_PER_MILE,
        }
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kilometers => write!(f, "km/h"),
            Self::Miles => write!(f, "mph"),
        }
    }
}

/// Run state reported by a console, normalized across vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusSignal {
    /// Belt is moving under a workout
    Running,
    /// Workout paused
    Paused,
    /// Workout stopped or summary shown
    Stopped,
    /// Console idle
    Standby,
    /// Vendor code with no known meaning
    Unknown(u8),
}

impl StatusSignal {
    /// Session activity this signal implies, `None` for unknown codes
    #[must_use]
    pub const fn implies_active(self) -> Option<bool> {
        match self {
            Self::Running => Some(true),
            Self::Paused | Self::Stopped | Self::Standby => Some(false),
            Self::Unknown(_) => None,
        }
    }
}

impl fmt::Display for StatusSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Standby => write!(f, "Standby"),
            Self::Unknown(raw) => write!(f, "Unknown({raw:#04X})"),
        }
    }
}

/// Workout session lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A session became active
    Started,
    /// The active session finished
    Ended,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "Session started"),
            Self::Ended => write!(f, "Session ended"),
        }
    }
}

/// Accumulated workout telemetry of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Distance in meters
    pub distance_meters: f32,
    /// Step count
    pub steps: u32,
    /// Workout duration in seconds
    pub duration_seconds: u32,
    /// Energy expended in kcal, when the console reports it
    pub calories: Option<u16>,
    /// Current belt speed in km/h, when the console reports it
    pub speed_kph: Option<f32>,
}

impl TelemetrySample {
    /// Merge a partial update, leaving fields it does not carry untouched
    ///
    /// Returns `true` when any field changed.
    pub fn apply(&mut self, update: &TelemetryUpdate) -> bool {
        let before = *self;

        if let Some(distance) = update.distance_meters {
            self.distance_meters = distance;
        }
        if let Some(steps) = update.steps {
            self.steps = steps;
        }
        if let Some(duration) = update.duration_seconds {
            self.duration_seconds = duration;
        }
        if update.calories.is_some() {
            self.calories = update.calories;
        }
        if update.speed_kph.is_some() {
            self.speed_kph = update.speed_kph;
        }

        before != *self
    }
}

/// Fields carried by a single decoded frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    /// Distance in meters
    pub distance_meters: Option<f32>,
    /// Step count
    pub steps: Option<u32>,
    /// Workout duration in seconds
    pub duration_seconds: Option<u32>,
    /// Energy expended in kcal
    pub calories: Option<u16>,
    /// Belt speed in km/h
    pub speed_kph: Option<f32>,
}

impl TelemetryUpdate {
    /// Check if the update carries no field at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.distance_meters.is_none()
            && self.steps.is_none()
            && self.duration_seconds.is_none()
            && self.calories.is_none()
            && self.speed_kph.is_none()
    }
}

/// Output of every protocol decoder
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodedFrame {
    /// Telemetry fields present in the frame
    pub telemetry: TelemetryUpdate,
    /// Run state carried by the frame, if any
    pub status: Option<StatusSignal>,
}

impl DecodedFrame {
    /// Frame carrying only a status signal
    #[must_use]
    pub fn status(signal: StatusSignal) -> Self {
        Self {
            telemetry: TelemetryUpdate::default(),
            status: Some(signal),
        }
    }

    /// Frame carrying only telemetry
    #[must_use]
    pub const fn telemetry(telemetry: TelemetryUpdate) -> Self {
        Self {
            telemetry,
            status: None,
        }
    }
}

/// Radio address of a peripheral as reported by the link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub String);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Peripheral address
    pub address: PeerAddress,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Create an advertisement with no name or services
    #[must_use]
    pub fn new(address: impl Into<PeerAddress>) -> Self {
        Self {
            address: address.into(),
            name: None,
            services: Vec::new(),
            rssi: None,
        }
    }

    /// Set the advertised name
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Add an advertised service
    #[must_use]
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }
}
