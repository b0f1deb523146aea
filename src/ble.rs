//! [`Link`] over the host Bluetooth adapter
//!
//! A background task follows the adapter's event stream: advertisements go to
//! the scanning device, disconnects to the device owning the connection.
//! Every connected peripheral gets its own task routing notifications into the
//! mailbox subscribed for their characteristic.

use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    link::{
        CharProps, CharacteristicHandle, ClientHandle, ConnectionObserver, Link, Mailbox,
        ScanFilter, ScanObserver, ServiceHandle,
    },
    types::{Advertisement, PeerAddress},
};

/// Longest wait for a connection to establish
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// State shared with the background tasks
#[derive(Default)]
struct Shared {
    peripherals: Mutex<HashMap<PeerAddress, Peripheral>>,
    scan_observer: Mutex<Option<Arc<dyn ScanObserver>>>,
    connection_observers: Mutex<HashMap<PeerAddress, Arc<dyn ConnectionObserver>>>,
    mailboxes: Mutex<HashMap<(PeerAddress, Uuid), Arc<Mailbox>>>,
}

impl Shared {
    async fn on_advertisement(&self, adapter: &Adapter, id: &PeripheralId) {
        let Some(observer) = self.scan_observer.lock().await.clone() else {
            return;
        };
        let Ok(peripheral) = adapter.peripheral(id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };

        let adv = advertisement(&properties);
        trace!("Advertisement: {:?}", adv);
        self.peripherals
            .lock()
            .await
            .insert(adv.address.clone(), peripheral);
        observer.on_result(&adv);
    }

    async fn on_disconnect(&self, adapter: &Adapter, id: &PeripheralId) {
        let Ok(peripheral) = adapter.peripheral(id).await else {
            return;
        };
        let address = PeerAddress(peripheral.address().to_string());
        self.mailboxes
            .lock()
            .await
            .retain(|(owner, _), _| *owner != address);
        let observer = self.connection_observers.lock().await.remove(&address);
        if let Some(observer) = observer {
            observer.on_disconnect(&address);
        }
    }
}

async fn route_events(adapter: Adapter, mut events: EventStream, shared: Arc<Shared>) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                shared.on_advertisement(&adapter, &id).await;
            }
            CentralEvent::DeviceDisconnected(id) => shared.on_disconnect(&adapter, &id).await,
            _ => {}
        }
    }
    warn!("Adapter event stream closed");
}

/// Build an advertisement from the properties the adapter reported
fn advertisement(properties: &PeripheralProperties) -> Advertisement {
    Advertisement {
        address: PeerAddress(properties.address.to_string()),
        name: properties.local_name.clone(),
        services: properties.services.clone(),
        rssi: properties.rssi,
    }
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn characteristic_handle(characteristic: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle {
        uuid: characteristic.uuid,
        service: characteristic.service_uuid,
        props: char_props(characteristic.properties),
    }
}

/// Await `attach`; if it fails, run `detach` before returning its error
async fn detach_on_error<T>(
    attach: impl Future<Output = Result<T>>,
    detach: impl Future<Output = Result<()>>,
) -> Result<T> {
    match attach.await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Setup failed, disconnecting: {}", e);
            if let Err(cleanup) = detach.await {
                warn!("Disconnect after failed setup: {}", cleanup);
            }
            Err(e)
        }
    }
}

/// btleplug-backed link on one adapter
pub struct BtleplugLink {
    adapter: Adapter,
    shared: Arc<Shared>,
    router: JoinHandle<()>,
    scan_timer: Mutex<Option<JoinHandle<()>>>,
    notification_tasks: Mutex<HashMap<PeerAddress, JoinHandle<()>>>,
}

impl fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

impl BtleplugLink {
    /// Open the first Bluetooth adapter of the host
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`Error::Transport`] when the host has no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("no Bluetooth adapter".to_string()))?;
        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ble`] if the adapter event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let events = adapter.events().await?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let shared = Arc::new(Shared::default());
        let router = tokio::spawn(route_events(adapter.clone(), events, shared.clone()));
        Ok(Self {
            adapter,
            shared,
            router,
            scan_timer: Mutex::new(None),
            notification_tasks: Mutex::new(HashMap::new()),
        })
    }

    async fn peripheral(&self, address: &PeerAddress) -> Result<Peripheral> {
        self.shared
            .peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("unknown peripheral {address}")))
    }

    async fn characteristic(
        &self,
        client: &ClientHandle,
        handle: &CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(&client.address).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
            .ok_or(Error::CharacteristicNotFound(handle.uuid))?;
        Ok((peripheral, characteristic))
    }

    async fn spawn_notification_router(
        &self,
        address: &PeerAddress,
        peripheral: &Peripheral,
    ) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let shared = self.shared.clone();
        let owner = address.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let key = (owner.clone(), notification.uuid);
                let mailbox = shared.mailboxes.lock().await.get(&key).cloned();
                match mailbox {
                    Some(mailbox) => mailbox.put(notification.value),
                    None => trace!("{}: unrouted notification on {}", owner, notification.uuid),
                }
            }
            debug!("{}: notification stream closed", owner);
        });

        if let Some(previous) = self
            .notification_tasks
            .lock()
            .await
            .insert(address.clone(), task)
        {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.router.abort();
    }
}

#[async_trait]
impl Link for BtleplugLink {
    async fn start_scan(
        &self,
        filter: &ScanFilter,
        window: Duration,
        observer: Arc<dyn ScanObserver>,
    ) -> Result<()> {
        let mut slot = self.shared.scan_observer.lock().await;
        if slot.is_some() {
            return Err(Error::ScanBusy);
        }
        self.adapter
            .start_scan(btleplug::api::ScanFilter {
                services: filter.services.clone(),
            })
            .await?;
        *slot = Some(observer);
        drop(slot);

        let shared = self.shared.clone();
        let adapter = self.adapter.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let observer = shared.scan_observer.lock().await.take();
            if let Some(observer) = observer {
                if let Err(e) = adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
                observer.on_scan_end();
            }
        });
        if let Some(previous) = self.scan_timer.lock().await.replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(timer) = self.scan_timer.lock().await.take() {
            timer.abort();
        }
        self.shared.scan_observer.lock().await.take();
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(
        &self,
        address: &PeerAddress,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<ClientHandle> {
        let peripheral = self.peripheral(address).await?;

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| Error::Transport(format!("connect to {address} timed out")))??;

        let attach = async {
            peripheral.discover_services().await?;
            self.shared
                .connection_observers
                .lock()
                .await
                .insert(address.clone(), observer.clone());
            self.spawn_notification_router(address, &peripheral).await?;
            Ok::<(), Error>(())
        };
        // a connected peripheral stops advertising, so later scans would miss it
        let detach = async {
            self.shared.connection_observers.lock().await.remove(address);
            peripheral.disconnect().await?;
            Ok::<(), Error>(())
        };
        detach_on_error(attach, detach).await?;
        observer.on_connect(address);

        Ok(ClientHandle {
            address: address.clone(),
        })
    }

    async fn disconnect(&self, client: &ClientHandle) -> Result<()> {
        // forget the observer first so our own disconnect is not reported
        self.shared
            .connection_observers
            .lock()
            .await
            .remove(&client.address);
        self.shared
            .mailboxes
            .lock()
            .await
            .retain(|(owner, _), _| *owner != client.address);
        if let Some(task) = self.notification_tasks.lock().await.remove(&client.address) {
            task.abort();
        }

        let peripheral = self.peripheral(&client.address).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn get_service(
        &self,
        client: &ClientHandle,
        uuid: Uuid,
    ) -> Result<Option<ServiceHandle>> {
        let peripheral = self.peripheral(&client.address).await?;
        Ok(peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == uuid)
            .map(|service| ServiceHandle {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(characteristic_handle)
                    .collect(),
            }))
    }

    async fn read(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(client, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(client, characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", data, characteristic.uuid);
        peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        client: &ClientHandle,
        characteristic: &CharacteristicHandle,
        mailbox: Arc<Mailbox>,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(client, characteristic).await?;
        self.shared
            .mailboxes
            .lock()
            .await
            .insert((client.address.clone(), characteristic.uuid), mailbox);
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }
}
