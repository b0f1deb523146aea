//! Wireless link capability
//!
//! [`Link`] is the narrow surface the devices need from a BLE stack: scan,
//! connect, look up characteristics, read, write and subscribe. Results of a
//! scan and connection lifecycle changes arrive asynchronously through the
//! observer traits; notification payloads land in a single-slot [`Mailbox`]
//! that the owning device drains on its next tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::Result,
    types::{Advertisement, PeerAddress},
};

/// Characteristic capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct CharProps {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Writable without response
    pub write_without_response: bool,
    /// Supports notifications
    pub notify: bool,
    /// Supports indications
    pub indicate: bool,
}

impl CharProps {
    /// Check if the characteristic can push values at all
    #[must_use]
    pub const fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Characteristic located during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the owning service
    pub service: Uuid,
    /// Capability flags
    pub props: CharProps,
}

/// Service located during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of the service
    pub characteristics: Vec<CharacteristicHandle>,
}

impl ServiceHandle {
    /// Look up a characteristic of this service
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicHandle> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Connected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    /// Peripheral address
    pub address: PeerAddress,
}

/// Which advertisements a device is interested in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Service UUIDs, any of which must be advertised (empty accepts all)
    pub services: Vec<Uuid>,
    /// Required local name prefix
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    /// Filter on an advertised service
    #[must_use]
    pub fn service(uuid: Uuid) -> Self {
        Self {
            services: vec![uuid],
            name_prefix: None,
        }
    }

    /// Filter on a local name prefix
    #[must_use]
    pub fn named(prefix: &str) -> Self {
        Self {
            services: Vec::new(),
            name_prefix: Some(prefix.to_string()),
        }
    }

    /// Check an advertisement against the filter
    #[must_use]
    pub fn matches(&self, adv: &Advertisement) -> bool {
        let service_ok =
            self.services.is_empty() || adv.services.iter().any(|s| self.services.contains(s));
        let name_ok = self.name_prefix.as_deref().is_none_or(|prefix| {
            adv.name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix))
        });
        service_ok && name_ok
    }
}

/// Receives scan results
pub trait ScanObserver: Send + Sync {
    /// An advertisement was seen
    fn on_result(&self, adv: &Advertisement);

    /// The scan window closed
    fn on_scan_end(&self);
}

/// Receives connection lifecycle changes
pub trait ConnectionObserver: Send + Sync {
    /// The peripheral connected
    fn on_connect(&self, address: &PeerAddress);

    /// The peripheral disconnected, for any reason
    fn on_disconnect(&self, address: &PeerAddress);
}

/// Single-slot notification buffer
///
/// A new payload replaces an unread one.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<Vec<u8>>>,
}

impl Mailbox {
    /// Create an empty mailbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a payload, replacing any unread one
    pub fn put(&self, payload: Vec<u8>) {
        if let Some(dropped) = self.lock().replace(payload) {
            debug!("Unread notification overwritten: {:02X?}", dropped);
        }
    }

    /// Take the payload, if any
    #[must_use]
    pub fn take(&self) -> Option<Vec<u8>> {
        self.lock().take()
    }

    /// Check if no payload is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }
}

/// BLE stack operations
#[async_trait]
pub trait Link: Send + Sync {
    /// Start a scan; results go to `observer` until the window closes or
    /// [`Link::stop_scan`] is called
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter refuses to scan.
    async fn start_scan(
        &self,
        filter: &ScanFilter,
        window: Duration,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<()>;

    /// Stop a running scan
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter rejects the request.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral; lifecycle changes go to `observer`
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral is unknown or the connection fails.
    async fn connect(
        &self,
        address: &PeerAddress,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<ClientHandle>;

    /// Drop the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the stack fails to disconnect.
    async fn disconnect(&self, client: &ClientHandle) -> Result<()>;

    /// Look up a service and its characteristics
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails; a missing service is `Ok(None)`.
    async fn get_service(&self, client: &ClientHandle, uuid: Uuid)
        -> Result<Option<ServiceHandle>>;

    /// Read a characteristic value
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn read(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>>;

    /// Write a characteristic value
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn write(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Subscribe to notifications (or indications when the characteristic
    /// only indicates); payloads are delivered to `mailbox`
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription is refused.
    async fn subscribe(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
        mailbox: Arc<Mailbox>,
    ) -> Result<()>;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-device state shared with the link callbacks
pub struct DeviceContext {
    id: u64,
    name: String,
    filter: ScanFilter,
    found: Mutex<Option<PeerAddress>>,
    scan_ended: AtomicBool,
    connected: AtomicBool,
    link_lost: AtomicBool,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Create a context for the device called `name`
    #[must_use]
    pub fn new(name: &str, filter: ScanFilter) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            filter,
            found: Mutex::new(None),
            scan_ended: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
        }
    }

    fn found_slot(&self) -> MutexGuard<'_, Option<PeerAddress>> {
        self.found.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity unique to this context, even among devices sharing a name
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Device name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scan filter of the device
    #[must_use]
    pub const fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Matching address found by the last scan
    #[must_use]
    pub fn found(&self) -> Option<PeerAddress> {
        self.found_slot().clone()
    }

    /// Forget the found address so the next attempt scans again
    pub fn clear_found(&self) {
        self.found_slot().take();
    }

    /// Prepare for a new scan
    pub fn begin_scan(&self) {
        self.clear_found();
        self.scan_ended.store(false, Ordering::SeqCst);
    }

    /// Whether the scan window closed
    #[must_use]
    pub fn scan_ended(&self) -> bool {
        self.scan_ended.load(Ordering::SeqCst)
    }

    /// Whether the link reported the peripheral connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Consume a pending disconnect report
    pub fn take_link_lost(&self) -> bool {
        self.link_lost.swap(false, Ordering::SeqCst)
    }
}

impl ScanObserver for DeviceContext {
    fn on_result(&self, adv: &Advertisement) {
        if !self.filter.matches(adv) {
            return;
        }
        let mut found = self.found_slot();
        if found.is_none() {
            info!(
                "{}: found {} ({})",
                self.name,
                adv.address,
                adv.name.as_deref().unwrap_or("unnamed")
            );
            *found = Some(adv.address.clone());
        }
    }

    fn on_scan_end(&self) {
        debug!("{}: scan ended", self.name);
        self.scan_ended.store(true, Ordering::SeqCst);
    }
}

impl ConnectionObserver for DeviceContext {
    fn on_connect(&self, address: &PeerAddress) {
        debug!("{}: {} connected", self.name, address);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn on_disconnect(&self, address: &PeerAddress) {
        info!("{}: {} disconnected", self.name, address);
        self.connected.store(false, Ordering::SeqCst);
        self.link_lost.store(true, Ordering::SeqCst);
    }
}

/// Serializes scans across devices sharing one adapter
///
/// Ownership is tracked by [`DeviceContext::id`], so two devices configured
/// with the same name still exclude each other.
#[derive(Debug, Default)]
pub struct ScanArbiter {
    owner: Mutex<Option<(u64, String)>>,
}

impl ScanArbiter {
    /// Create a free arbiter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(u64, String)>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the scanner for `device`; re-entrant for the current owner
    pub fn try_acquire(&self, device: &DeviceContext) -> bool {
        let mut current = self.lock();
        match current.as_ref() {
            None => {
                *current = Some((device.id(), device.name().to_string()));
                true
            }
            Some((holder, _)) => *holder == device.id(),
        }
    }

    /// Give the scanner back; ignored unless `device` holds it
    pub fn release(&self, device: &DeviceContext) {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|(holder, _)| *holder == device.id()) {
            *current = None;
        }
    }

    /// Name of the current holder
    #[must_use]
    pub fn owner(&self) -> Option<String> {
        self.lock().as_ref().map(|(_, name)| name.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const FTMS: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);
    const OTHER: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

    #[test]
    fn test_mailbox_keeps_latest() {
        let mailbox = Mailbox::new();
        assert!(mailbox.is_empty());

        mailbox.put(vec![1]);
        mailbox.put(vec![2, 3]);
        assert_eq!(mailbox.take(), Some(vec![2, 3]));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_scan_filter() {
        let by_service = ScanFilter::service(FTMS);
        assert!(by_service.matches(&Advertisement::new("A").with_service(FTMS)));
        assert!(!by_service.matches(&Advertisement::new("A").with_service(OTHER)));
        assert!(!by_service.matches(&Advertisement::new("A")));

        let by_name = ScanFilter::named("LifeSpan-TM");
        assert!(by_name.matches(&Advertisement::new("B").with_name("LifeSpan-TM 5000")));
        assert!(!by_name.matches(&Advertisement::new("B").with_name("Lifespan")));
        assert!(!by_name.matches(&Advertisement::new("B")));
    }

    #[test]
    fn test_context_records_first_match() {
        let ctx = DeviceContext::new("ftms", ScanFilter::service(FTMS));

        ctx.on_result(&Advertisement::new("00:00").with_service(OTHER));
        assert_eq!(ctx.found(), None);

        ctx.on_result(&Advertisement::new("11:11").with_service(FTMS));
        ctx.on_result(&Advertisement::new("22:22").with_service(FTMS));
        assert_eq!(ctx.found(), Some(PeerAddress::from("11:11")));

        ctx.on_scan_end();
        assert!(ctx.scan_ended());
        ctx.begin_scan();
        assert!(!ctx.scan_ended());
        assert_eq!(ctx.found(), None);
    }

    #[test]
    fn test_context_connection_events() {
        let ctx = Arc::new(DeviceContext::new("ftms", ScanFilter::default()));
        let address = PeerAddress::from("11:11");

        ctx.on_connect(&address);
        assert!(ctx.is_connected());
        assert!(!ctx.take_link_lost());

        ctx.on_disconnect(&address);
        assert!(!ctx.is_connected());
        assert!(ctx.take_link_lost());
        assert!(!ctx.take_link_lost());
    }

    #[test]
    fn test_scan_arbiter() {
        let arbiter = ScanArbiter::new();
        let ftms = DeviceContext::new("ftms", ScanFilter::default());
        let console = DeviceContext::new("console", ScanFilter::default());

        assert!(arbiter.try_acquire(&ftms));
        assert!(arbiter.try_acquire(&ftms));
        assert!(!arbiter.try_acquire(&console));

        arbiter.release(&console);
        assert_eq!(arbiter.owner().as_deref(), Some("ftms"));

        arbiter.release(&ftms);
        assert!(arbiter.try_acquire(&console));
    }

    #[test]
    fn test_scan_arbiter_tells_same_named_devices_apart() {
        let arbiter = ScanArbiter::new();
        let first = DeviceContext::new("treadmill", ScanFilter::default());
        let second = DeviceContext::new("treadmill", ScanFilter::default());
        assert_ne!(first.id(), second.id());

        assert!(arbiter.try_acquire(&first));
        assert!(!arbiter.try_acquire(&second));

        arbiter.release(&second);
        assert!(!arbiter.try_acquire(&second));
        arbiter.release(&first);
        assert!(arbiter.try_acquire(&second));
    }

    #[test]
    fn test_char_props() {
        assert!(CharProps {
            indicate: true,
            ..Default::default()
        }
        .can_subscribe());
        assert!(!CharProps::default().can_subscribe());
    }
}
