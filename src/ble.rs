//! [`Transport`] implementation backed by btleplug.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{Advertisement, Link, LinkEvent, Transport};

/// How long [`BleTransport::open`] keeps scanning for an address that the
/// adapter has not seen yet.
const LOOKUP_WINDOW: Duration = Duration::from_secs(5);

/// Bluetooth Low Energy transport using the first available adapter.
///
/// The adapter is acquired lazily on first use, inside the caller's runtime.
#[derive(Default)]
pub struct BleTransport {
    adapter: OnceCell<Adapter>,
}

impl BleTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| TransportError::Other("No Bluetooth adapter found".into()))?;
                wait_powered_on(&adapter).await;
                Ok(adapter)
            })
            .await
    }

    /// Find a known peripheral whose platform id or MAC address equals `address`.
    async fn lookup(adapter: &Adapter, address: &str) -> Option<Peripheral> {
        for p in adapter.peripherals().await.unwrap_or_default() {
            if p.id().to_string().eq_ignore_ascii_case(address) {
                return Some(p);
            }
            if let Ok(Some(props)) = p.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Some(p);
                }
            }
        }
        None
    }

    /// Poll until `address` shows up or [`LOOKUP_WINDOW`] expires.
    async fn find(adapter: &Adapter, address: &str) -> Result<Peripheral, TransportError> {
        if let Some(p) = Self::lookup(adapter, address).await {
            return Ok(p);
        }

        debug!("{address} not cached; scanning for up to {LOOKUP_WINDOW:?}");
        adapter.start_scan(ScanFilter::default()).await?;
        let found = tokio::time::timeout(LOOKUP_WINDOW, async {
            loop {
                if let Some(p) = Self::lookup(adapter, address).await {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;
        adapter.stop_scan().await.ok();

        found.map_err(|_| TransportError::NotFound(address.to_owned()))
    }
}

/// macOS starts CBCentralManager in an "unknown" state; scanning before it
/// reports PoweredOn is a silent no-op.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("adapter still {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

/// Convert a btleplug error, attributing "device not found" to `address`.
fn for_address(address: &str) -> impl Fn(btleplug::Error) -> TransportError + '_ {
    move |err| match err {
        btleplug::Error::DeviceNotFound => TransportError::NotFound(address.to_owned()),
        other => other.into(),
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn discover(&self, window: Duration) -> Result<Vec<Advertisement>, TransportError> {
        let adapter = self.adapter().await?;

        info!("discover: scanning for {window:?} …");
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;
        adapter.stop_scan().await.ok();

        let mut seen = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                seen.push(Advertisement {
                    name: props.local_name,
                    address: p.id().to_string(),
                    services: props.services,
                });
            }
        }
        debug!("discover: {} advertisement(s)", seen.len());
        Ok(seen)
    }

    async fn open(
        &self,
        address: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let adapter = self.adapter().await?;
        let peripheral = Self::find(adapter, address).await?;

        // Subscribed before connecting so a drop at any later point is seen.
        let central_events = adapter.events().await?;
        peripheral.connect().await.map_err(for_address(address))?;

        let prepared = async {
            // BlueZ reports the connection before its GATT cache is populated;
            // discovering immediately can return an empty service set.
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            peripheral
                .discover_services()
                .await
                .map_err(for_address(address))?;
            Ok::<_, TransportError>(peripheral.notifications().await?)
        }
        .await;
        let mut notifications = match prepared {
            Ok(stream) => stream,
            Err(e) => {
                peripheral.disconnect().await.ok();
                return Err(e);
            }
        };

        let characteristics = peripheral.characteristics();
        info!(
            "{address}: connected, {} characteristic(s) discovered",
            characteristics.len()
        );

        let disconnect_tx = events.clone();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            let mut central_events = central_events;
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("disconnect watcher: {id:?} dropped the link");
                        let _ = disconnect_tx.send(LinkEvent::Disconnected).await;
                        break;
                    }
                }
            }
        });

        let pump = tokio::spawn(async move {
            let mut dropped: u64 = 0;
            while let Some(notif) = notifications.next().await {
                let event = LinkEvent::Notification {
                    characteristic: notif.uuid,
                    value: notif.value,
                };
                if events.try_send(event).is_err() {
                    dropped += 1;
                    if dropped == 1 || dropped % 500 == 0 {
                        warn!("notification queue full, {dropped} notification(s) dropped");
                    }
                }
            }
            debug!("notification stream ended");
        });

        Ok(Box::new(BleLink {
            peripheral,
            characteristics,
            tasks: vec![watcher, pump],
        }))
    }
}

/// A connected btleplug peripheral.
struct BleLink {
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleLink {
    fn find_char(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl Link for BleLink {
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let c = self.find_char(characteristic)?;
        self.peripheral
            .write(c, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let c = self.find_char(characteristic)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let c = self.find_char(characteristic)?;
        self.peripheral.subscribe(c).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let c = self.find_char(characteristic)?;
        self.peripheral.unsubscribe(c).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        for task in &self.tasks {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
