//! Transport over BlueZ
//!
//! Implements `Transport` with `bluer`. Each request spawns a task that
//! reports its completion through the link's `EventSender`; adapter power
//! changes, device disconnects and characteristic notifications are
//! forwarded the same way.

use crate::connection::{CharacteristicInfo, DeviceHandle, EventSender, Transport, TransportEvent};
use crate::services;
use crate::types::{G4Error, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty};
use chrono::Utc;
use futures::stream::StreamExt;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

/// How long to wait for BlueZ to resolve GATT services after connecting
const SERVICES_RESOLVED_ATTEMPTS: u32 = 30;

impl From<bluer::Error> for G4Error {
    fn from(err: bluer::Error) -> Self {
        G4Error::Bluetooth(err.to_string())
    }
}

pub struct BluezTransport {
    adapter: Adapter,
    events: EventSender,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    listeners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    watchers: Mutex<HashMap<DeviceHandle, JoinHandle<()>>>,
    /// Outstanding connect requests
    connecting: Mutex<HashMap<DeviceHandle, JoinHandle<()>>>,
    adapter_watcher: JoinHandle<()>,
}

impl BluezTransport {
    /// Wrap `adapter`, reporting to `events`
    pub async fn new(adapter: Adapter, events: EventSender) -> Result<Self> {
        let stream = adapter.events().await?;
        let sender = events.clone();
        let adapter_watcher = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(event) = stream.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    info!("Adapter powered: {}", powered);
                    if sender
                        .send(TransportEvent::AdapterStateChanged { powered })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            adapter,
            events,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            adapter_watcher,
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn device(&self, handle: &DeviceHandle) -> Result<Device> {
        let address: Address = handle
            .as_str()
            .parse()
            .map_err(|_| G4Error::InvalidAddress(handle.to_string()))?;
        Ok(self.adapter.device(address)?)
    }

    /// Report the device dropping its connection
    async fn watch_device(&self, device: &Device, handle: &DeviceHandle) -> Result<()> {
        let stream = device.events().await?;
        let events = self.events.clone();
        let watched = handle.clone();
        let task = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(event) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    debug!("{} dropped the connection", watched);
                    let _ = events.send(TransportEvent::Disconnected {
                        device: watched.clone(),
                        error: None,
                    });
                }
            }
        });

        if let Some(previous) = self.watchers.lock().await.insert(handle.clone(), task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        self.adapter_watcher.abort();
        for task in self.listeners.get_mut().values() {
            task.abort();
        }
        for task in self.watchers.get_mut().values() {
            task.abort();
        }
        for task in self.connecting.get_mut().values() {
            task.abort();
        }
    }
}

async fn wait_for_services(device: &Device) -> Result<()> {
    for _ in 0..SERVICES_RESOLVED_ATTEMPTS {
        if device.is_services_resolved().await? {
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }
    Err(G4Error::Bluetooth(
        "Timeout waiting for GATT services to be resolved".to_string(),
    ))
}

/// Services BlueZ already knows for a connected device
async fn known_services(device: &Device) -> Vec<Uuid> {
    if !matches!(device.is_services_resolved().await, Ok(true)) {
        return Vec::new();
    }
    let mut uuids = Vec::new();
    if let Ok(remote_services) = device.services().await {
        for service in remote_services {
            if let Ok(uuid) = service.uuid().await {
                uuids.push(uuid);
            }
        }
    }
    uuids
}

/// Characteristics of `service` once GATT resolution completes
async fn resolve_service(device: &Device, service: Uuid) -> Result<Vec<(Uuid, Characteristic)>> {
    wait_for_services(device).await?;

    for remote in device.services().await? {
        if remote.uuid().await? != service {
            continue;
        }
        let mut found = Vec::new();
        for characteristic in remote.characteristics().await? {
            found.push((characteristic.uuid().await?, characteristic));
        }
        debug!("{} has {} characteristics", services::label(&service), found.len());
        return Ok(found);
    }

    Err(G4Error::Bluetooth(format!(
        "{} not offered by device",
        services::label(&service)
    )))
}

async fn describe(
    found: &[(Uuid, Characteristic)],
    wanted: Option<&[Uuid]>,
) -> Vec<CharacteristicInfo> {
    let mut described = Vec::new();
    for (uuid, characteristic) in found {
        if wanted.map_or(true, |w| w.contains(uuid)) {
            described.push(characteristic_info(*uuid, characteristic.notifying().await));
        }
    }
    described
}

/// An unreadable notify flag counts as not notifying, so a subscribe is issued
fn characteristic_info<E>(
    uuid: Uuid,
    notifying: std::result::Result<bool, E>,
) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        is_notifying: notifying.unwrap_or(false),
    }
}

/// Whether a device's advertised UUIDs include `service`; unreadable UUIDs do not
fn offers_service<E: fmt::Display>(
    uuids: std::result::Result<Option<HashSet<Uuid>>, E>,
    service: &Uuid,
) -> bool {
    match uuids {
        Ok(uuids) => uuids.is_some_and(|uuids| uuids.contains(service)),
        Err(e) => {
            debug!("Skipping device with unreadable services: {}", e);
            false
        }
    }
}

/// A failed disconnect only matters while the device is still connected
fn disconnect_outcome<E: fmt::Display>(
    result: std::result::Result<(), E>,
    still_connected: bool,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if !still_connected => {
            debug!("Disconnect on idle device: {}", e);
            Ok(())
        }
        Err(e) => Err(G4Error::Bluetooth(e.to_string())),
    }
}

#[async_trait::async_trait]
impl Transport for BluezTransport {
    async fn is_adapter_ready(&self) -> Result<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn find_connected_devices(&self, service: Uuid) -> Result<Vec<DeviceHandle>> {
        let mut found = Vec::new();
        for address in self.adapter.device_addresses().await? {
            let device = match self.adapter.device(address) {
                Ok(device) => device,
                Err(_) => continue,
            };
            if !device.is_connected().await.unwrap_or(false) {
                continue;
            }
            if offers_service(device.uuids().await, &service) {
                found.push(DeviceHandle::new(address.to_string()));
            }
        }
        debug!("{} connected device(s) offer the service", found.len());
        Ok(found)
    }

    async fn connect(&self, handle: &DeviceHandle) -> Result<()> {
        let device = self.device(handle)?;
        self.watch_device(&device, handle).await?;

        let events = self.events.clone();
        let connecting = handle.clone();
        let task = tokio::spawn(async move {
            let event = match device.connect().await {
                Ok(()) => TransportEvent::Connected {
                    known_services: known_services(&device).await,
                    device: connecting,
                },
                Err(e) => TransportEvent::ConnectFailed {
                    device: connecting,
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event);
        });

        if let Some(previous) = self.connecting.lock().await.insert(handle.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn discover_service(&self, handle: &DeviceHandle, service: Uuid) -> Result<()> {
        let device = self.device(handle)?;
        let events = self.events.clone();
        let cache = self.characteristics.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let event = match resolve_service(&device, service).await {
                Ok(found) => {
                    let known_characteristics = describe(&found, None).await;
                    cache.lock().await.extend(found);
                    TransportEvent::ServiceDiscovered {
                        device: handle,
                        known_characteristics,
                        error: None,
                    }
                }
                Err(e) => TransportEvent::ServiceDiscovered {
                    device: handle,
                    known_characteristics: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        handle: &DeviceHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let device = self.device(handle)?;
        let events = self.events.clone();
        let cache = self.characteristics.clone();
        let handle = handle.clone();
        let wanted = characteristics.to_vec();
        tokio::spawn(async move {
            let event = match resolve_service(&device, service).await {
                Ok(found) => {
                    let characteristics = describe(&found, Some(wanted.as_slice())).await;
                    cache.lock().await.extend(found);
                    TransportEvent::CharacteristicsDiscovered {
                        device: handle,
                        characteristics,
                        error: None,
                    }
                }
                Err(e) => TransportEvent::CharacteristicsDiscovered {
                    device: handle,
                    characteristics: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn subscribe(&self, handle: &DeviceHandle, characteristic: Uuid) -> Result<()> {
        let remote = self
            .characteristics
            .lock()
            .await
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| {
                G4Error::NotificationState(format!(
                    "{} not discovered",
                    services::label(&characteristic)
                ))
            })?;

        let events = self.events.clone();
        let handle = handle.clone();
        let task = tokio::spawn(async move {
            let stream = match remote.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(TransportEvent::NotificationStateChanged {
                        device: handle,
                        characteristic,
                        is_notifying: false,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };

            let _ = events.send(TransportEvent::NotificationStateChanged {
                device: handle.clone(),
                characteristic,
                is_notifying: true,
                error: None,
            });

            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                let sent = events.send(TransportEvent::Notification {
                    device: handle.clone(),
                    characteristic,
                    value,
                    received_at: Utc::now(),
                });
                if sent.is_err() {
                    break;
                }
            }
            debug!(
                "{} notification stream ended",
                services::label(&characteristic)
            );
        });

        if let Some(previous) = self.listeners.lock().await.insert(characteristic, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<()> {
        for (_, task) in self.listeners.lock().await.drain() {
            task.abort();
        }
        if let Some(task) = self.watchers.lock().await.remove(handle) {
            task.abort();
        }
        if let Some(task) = self.connecting.lock().await.remove(handle) {
            task.abort();
        }

        // Also cancels a connect BlueZ still has pending
        let device = self.device(handle)?;
        let result = device.disconnect().await;
        let still_connected = result.is_err() && device.is_connected().await.unwrap_or(false);
        disconnect_outcome(result, still_connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_of_idle_device_succeeds() {
        assert!(disconnect_outcome::<&str>(Ok(()), false).is_ok());
        assert!(disconnect_outcome(Err("Not Connected"), false).is_ok());
        assert_eq!(
            disconnect_outcome(Err("Operation failed"), true),
            Err(G4Error::Bluetooth("Operation failed".to_string()))
        );
    }

    #[test]
    fn test_unreadable_device_does_not_offer_service() {
        let service = services::CGM_SERVICE;
        let offered: HashSet<Uuid> = [service].into_iter().collect();
        assert!(offers_service::<&str>(Ok(Some(offered)), &service));
        assert!(!offers_service::<&str>(Ok(Some(HashSet::new())), &service));
        assert!(!offers_service::<&str>(Ok(None), &service));
        assert!(!offers_service(Err("Does Not Exist"), &service));
    }

    #[test]
    fn test_characteristic_notify_state_reported() {
        let rx = services::RX_CHARACTERISTIC;
        assert!(characteristic_info::<&str>(rx, Ok(true)).is_notifying);
        assert!(!characteristic_info::<&str>(rx, Ok(false)).is_notifying);
        assert!(!characteristic_info(rx, Err("Failed")).is_notifying);
    }
}
