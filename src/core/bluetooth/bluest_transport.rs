//! bluest transport
//! Runs the GATT primitives on the platform stack through the `bluest` crate.
//! bluest streams borrow the adapter or characteristic they came from, so each
//! one is driven by a task owning a clone and forwarded over a channel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::core::bluetooth::advertisement::AdvertisementData;
use crate::core::bluetooth::capability::CharacteristicProperties;
use crate::core::bluetooth::constants::ATT_HEADER_LEN;
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::identity::{extract_mac_address, MacAddress, PeripheralIdentity};
use crate::core::bluetooth::transport::{
    receiver_stream, Advertisement, GattTransport, LinkEvent, LinkEventStream, NotificationStream,
    RemoteCharacteristic, RemoteService, ScanReport, ScanResult, ScanStream,
};
use crate::core::bluetooth::types::ScanFilter;
use crate::utils::lock;

fn transport_error(e: bluest::Error) -> TransportError {
    TransportError::failure(e.to_string())
}

/// Identity of a bluest device. Platforms that hide the address (macOS) get
/// a stable identity derived from the device id instead.
fn identity_of(device: &Device) -> PeripheralIdentity {
    let id = device.id().to_string();
    if let Some(mac) = extract_mac_address(&id) {
        return PeripheralIdentity::from_mac(mac);
    }
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    let mut mac: MacAddress = [0; 6];
    mac.copy_from_slice(&bytes[2..]);
    PeripheralIdentity::from_mac(mac)
}

fn advertisement_of(discovered: &AdvertisingDevice) -> AdvertisementData {
    let adv = &discovered.adv_data;
    let mut data = AdvertisementData {
        local_name: adv.local_name.clone().or_else(|| discovered.device.name().ok()),
        services: adv.services.clone(),
        ..AdvertisementData::default()
    };
    if let Some(manufacturer) = &adv.manufacturer_data {
        data.manufacturer_data
            .insert(manufacturer.company_id, manufacturer.data.clone());
    }
    data
}

fn properties_of(properties: bluest::CharacteristicProperties) -> CharacteristicProperties {
    let flags = [
        (properties.broadcast, CharacteristicProperties::BROADCAST),
        (properties.read, CharacteristicProperties::READ),
        (properties.write_without_response, CharacteristicProperties::WRITE_NO_RESPONSE),
        (properties.write, CharacteristicProperties::WRITE),
        (properties.notify, CharacteristicProperties::NOTIFY),
        (properties.indicate, CharacteristicProperties::INDICATE),
        (properties.authenticated_signed_writes, CharacteristicProperties::SIGNED_WRITE),
        (properties.extended_properties, CharacteristicProperties::EXTENDED_PROPS),
    ];
    flags
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(CharacteristicProperties::NONE, |acc, (_, flag)| acc | flag)
}

/// GATT transport on the default system adapter
pub struct BluestTransport {
    adapter: Adapter,
    /// Characteristics of the connected device, used to read back the MTU
    characteristics: Mutex<Vec<Characteristic>>,
    /// Notification forwarders by characteristic
    notifications: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl BluestTransport {
    /// Opens the default adapter and waits until it is powered on
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            characteristics: Mutex::new(Vec::new()),
            notifications: Mutex::new(HashMap::new()),
        })
    }

    fn stop_notifications(&self) {
        for (uuid, forwarder) in lock(&self.notifications).drain() {
            debug!("Stopping notifications on {}", uuid);
            forwarder.abort();
        }
    }
}

#[async_trait]
impl GattTransport for BluestTransport {
    type Peripheral = Device;
    type Characteristic = Characteristic;

    async fn scan(&self, filter: ScanFilter) -> Result<ScanStream<Device>, TransportError> {
        let services = match filter {
            ScanFilter::Service(uuid) => vec![uuid],
            _ => Vec::new(),
        };
        let adapter = self.adapter.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(transport_error(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    discovered = scan_stream.next() => match discovered {
                        Some(discovered) => {
                            let report = ScanReport::Result(ScanResult {
                                identity: identity_of(&discovered.device),
                                rssi: discovered.rssi.unwrap_or_default(),
                                advertisement: Advertisement::Decoded(advertisement_of(&discovered)),
                                peripheral: discovered.device,
                            });
                            if tx.send(report).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("Platform scan stopped");
        });

        started_rx
            .await
            .map_err(|_| TransportError::failure("scan task ended before starting"))??;
        Ok(receiver_stream(rx))
    }

    async fn connect(&self, peripheral: &Device) -> Result<(), TransportError> {
        if peripheral.is_connected().await {
            info!("Device {} already connected.", peripheral.id());
            return Ok(());
        }
        info!("Initiating connection to {}...", peripheral.id());
        self.adapter.connect_device(peripheral).await.map_err(transport_error)
    }

    async fn discover_services(&self, peripheral: &Device) -> Result<Vec<RemoteService<Characteristic>>, TransportError> {
        let services = peripheral.services().await.map_err(transport_error)?;
        let mut remote = Vec::with_capacity(services.len());
        let mut all_characteristics = Vec::new();

        for service in services {
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await.map_err(transport_error)? {
                let properties = characteristic.properties().await.map_err(transport_error)?;
                all_characteristics.push(characteristic.clone());
                characteristics.push(RemoteCharacteristic {
                    uuid: characteristic.uuid(),
                    properties: properties_of(properties),
                    handle: characteristic,
                });
            }
            remote.push(RemoteService {
                uuid: service.uuid(),
                characteristics,
            });
        }

        *lock(&self.characteristics) = all_characteristics;
        Ok(remote)
    }

    /// The OS negotiates the MTU itself; this reports what it settled on
    async fn request_mtu(&self, _peripheral: &Device, mtu: u16) -> Result<u16, TransportError> {
        let characteristic = lock(&self.characteristics)
            .first()
            .cloned()
            .ok_or_else(|| TransportError::failure("no characteristics discovered"))?;
        let max_write = characteristic.max_write_len().map_err(transport_error)?;
        let negotiated = u16::try_from(max_write)
            .unwrap_or(u16::MAX - ATT_HEADER_LEN)
            .saturating_add(ATT_HEADER_LEN);
        debug!("Requested MTU {}, platform negotiated {}", mtu, negotiated);
        Ok(negotiated)
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, TransportError> {
        characteristic.read().await.map_err(transport_error)
    }

    async fn write(&self, characteristic: &Characteristic, payload: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        characteristic.write(payload).await.map_err(transport_error)?;
        // bluest does not report the bytes sent
        Ok(None)
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<NotificationStream, TransportError> {
        let uuid = characteristic.uuid();
        let characteristic = characteristic.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        let forwarder = tokio::spawn(async move {
            let mut notification_stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(transport_error(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    value = notification_stream.next() => match value {
                        Some(Ok(value)) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => warn!("Notification error on {}: {}", uuid, e),
                        None => break,
                    },
                }
            }
        });

        if let Some(old) = lock(&self.notifications).insert(uuid, forwarder.abort_handle()) {
            old.abort();
        }
        started_rx
            .await
            .map_err(|_| TransportError::failure("notification task ended before subscribing"))??;
        Ok(receiver_stream(rx))
    }

    async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<(), TransportError> {
        if let Some(forwarder) = lock(&self.notifications).remove(&characteristic.uuid()) {
            forwarder.abort();
        }
        Ok(())
    }

    async fn bond(&self, peripheral: &Device) -> Result<(), TransportError> {
        if peripheral.is_paired().await.map_err(transport_error)? {
            info!("Device {} is already paired", peripheral.id());
            return Ok(());
        }
        peripheral.pair().await.map_err(transport_error)
    }

    async fn disconnect(&self, peripheral: &Device) -> Result<(), TransportError> {
        self.stop_notifications();
        lock(&self.characteristics).clear();
        if !peripheral.is_connected().await {
            info!("Device {} not connected", peripheral.id());
            return Ok(());
        }
        info!("Disconnecting from device {}", peripheral.id());
        self.adapter.disconnect_device(peripheral).await.map_err(transport_error)
    }

    async fn link_events(&self, peripheral: &Device) -> Result<LinkEventStream, TransportError> {
        let adapter = self.adapter.clone();
        let device = peripheral.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => {
                    let _ = started_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = started_tx.send(Err(transport_error(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => {
                        let event = match event {
                            Some(ConnectionEvent::Connected) => LinkEvent::Connected,
                            Some(ConnectionEvent::Disconnected) => LinkEvent::Disconnected,
                            None => break,
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        started_rx
            .await
            .map_err(|_| TransportError::failure("link event task ended before starting"))??;
        Ok(receiver_stream(rx))
    }
}
