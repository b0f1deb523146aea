use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::{device::DeviceKind, link::ScanArbiter};

/// Default gap between ticks
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Cooperative driver polling every device once per tick
///
/// Devices of one scheduler share a [`ScanArbiter`], so only one of them
/// scans at a time.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use treadsync::{BtleplugLink, FtmsDevice, LogSink, Scheduler};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let link = Arc::new(BtleplugLink::new().await?);
///     let mut scheduler = Scheduler::default();
///     scheduler.add(FtmsDevice::new(
///         &FtmsDevice::default_config("ftms"),
///         link,
///         scheduler.arbiter(),
///         Arc::new(LogSink),
///     ));
///     scheduler.run_until(tokio::signal::ctrl_c()).await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Scheduler {
    devices: Vec<DeviceKind>,
    arbiter: Arc<ScanArbiter>,
    period: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl Scheduler {
    /// Create an empty scheduler ticking every `period`
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            devices: Vec::new(),
            arbiter: Arc::new(ScanArbiter::new()),
            period,
        }
    }

    /// Scanner arbiter to hand to devices added to this scheduler
    #[must_use]
    pub fn arbiter(&self) -> Arc<ScanArbiter> {
        self.arbiter.clone()
    }

    /// Add a device
    pub fn add(&mut self, device: impl Into<DeviceKind>) {
        let device = device.into();
        info!("Scheduling {}", device.name());
        self.devices.push(device);
    }

    /// Scheduled devices
    #[must_use]
    pub fn devices(&self) -> &[DeviceKind] {
        &self.devices
    }

    /// Send the reset command on every device at its next tick
    pub fn request_reset(&mut self) {
        info!("Reset requested on {} device(s)", self.devices.len());
        for device in &mut self.devices {
            device.request_reset();
        }
    }

    /// Poll every device once
    ///
    /// Errors are logged and never stop the loop; the failing device retries
    /// on later ticks.
    pub async fn tick(&mut self, now: Instant) {
        for device in &mut self.devices {
            trace!("Tick {}", device.name());
            if let Err(e) = device.poll(now).await {
                if e.is_frame_error() {
                    debug!("{}: {}", device.name(), e);
                } else if e.is_recoverable() {
                    warn!("{}: {}", device.name(), e);
                } else {
                    error!("{}: {}", device.name(), e);
                }
            }
        }
    }

    /// Tick until `shutdown` completes
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future,
    {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopped");
                    return;
                }
                _ = interval.tick() => self.tick(Instant::now()).await,
            }
        }
    }
}
