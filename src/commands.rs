//! Adaptor commands
//! This module defines the operations the binary can run against the adaptor.
//! Each one turns the adaptor's callbacks and events into a single awaited result.

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::info;
use tokio::sync::oneshot;

use crate::core::bluetooth::{
    AdaptorEvent, BleError, CapabilityCatalog, DataSink, DeviceRecord, GattTransport, PeripheralIdentity,
    ReadCompletion, WriteCompletion,
};
use crate::state::AppState;

/// Scans for the configured duration and returns what was found
pub async fn scan_devices<T: GattTransport>(
    app_state: &AppState<T>,
    service_id: Option<&str>,
    manufacturer_id: u16,
) -> Result<Vec<DeviceRecord>> {
    let adaptor = &app_state.adaptor;
    let (_subscription, mut events) = adaptor.subscribe();
    let duration = Duration::from_secs(app_state.config().scan_duration_secs);

    adaptor.scan(service_id, manufacturer_id, Some(duration))?;
    while let Some(event) = events.recv().await {
        match event {
            AdaptorEvent::DeviceDiscovered(record) => {
                info!("Found {} ({}, {} dBm)", record.short_id(), record.name, record.rssi)
            }
            AdaptorEvent::ScanFailed(code) => return Err(BleError::ScanFailed(code).into()),
            AdaptorEvent::DiscoveryFinished => break,
            _ => {}
        }
    }
    Ok(adaptor.devices())
}

/// Scans for `address`, then connects to it and validates it against `catalog`
pub async fn connect_to_device<T: GattTransport>(
    app_state: &AppState<T>,
    address: &str,
    catalog: CapabilityCatalog,
) -> Result<PeripheralIdentity> {
    let adaptor = &app_state.adaptor;
    let identity = PeripheralIdentity::parse_address(address)?;
    let (_subscription, mut events) = adaptor.subscribe();
    let duration = Duration::from_secs(app_state.config().scan_duration_secs);

    info!("Looking for device {}", identity);
    adaptor.scan_single_device(address, Some(duration))?;
    let mut found = false;
    while let Some(event) = events.recv().await {
        match event {
            AdaptorEvent::DeviceDiscovered(record) if record.identity == identity => {
                found = true;
                break;
            }
            AdaptorEvent::ScanFailed(code) => return Err(BleError::ScanFailed(code).into()),
            AdaptorEvent::DiscoveryFinished => break,
            _ => {}
        }
    }
    adaptor.cancel_scan();
    if !found {
        return Err(anyhow!("Device not found with address: {}", address));
    }

    let (tx, rx) = oneshot::channel();
    adaptor.connect_to_device(
        identity,
        catalog,
        adaptor.default_connect_options(),
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    )?;
    rx.await.map_err(|_| anyhow!("Adaptor dropped the connect request"))??;
    info!("Device {} connected and validated", identity);
    Ok(identity)
}

pub async fn read_characteristic<T: GattTransport>(
    app_state: &AppState<T>,
    characteristic_id: &str,
) -> Result<ReadCompletion> {
    let (tx, rx) = oneshot::channel();
    app_state.adaptor.read_characteristic(
        characteristic_id,
        Some(Box::new(move |completion| {
            let _ = tx.send(completion);
        })),
    )?;
    let completion = rx.await.map_err(|_| anyhow!("Adaptor dropped the read request"))?;
    if !completion.success() {
        return Err(anyhow!(
            "Read of {} failed with status {}",
            characteristic_id,
            completion.status
        ));
    }
    Ok(completion)
}

pub async fn write_characteristic<T: GattTransport>(
    app_state: &AppState<T>,
    characteristic_id: &str,
    payload: Vec<u8>,
) -> Result<WriteCompletion> {
    let (tx, rx) = oneshot::channel();
    app_state.adaptor.write_characteristic(
        characteristic_id,
        payload,
        Some(Box::new(move |completion| {
            let _ = tx.send(completion);
        })),
    )?;
    let completion = rx.await.map_err(|_| anyhow!("Adaptor dropped the write request"))?;
    if !completion.success {
        return Err(anyhow!(
            "Write to {} failed with status {}",
            characteristic_id,
            completion.status
        ));
    }
    Ok(completion)
}

/// Enables notifications and waits for the subscription to be acknowledged
pub async fn enable_notifications<T: GattTransport>(
    app_state: &AppState<T>,
    characteristic_id: &str,
    on_data: DataSink,
) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    app_state.adaptor.notify_characteristic(
        characteristic_id,
        Some(on_data),
        Some(Box::new(move |ack| {
            let _ = tx.send(ack);
        })),
    )?;
    let ack = rx.await.map_err(|_| anyhow!("Adaptor dropped the subscribe request"))?;
    if !ack.success {
        return Err(anyhow!(
            "Enabling notifications on {} failed with status {}",
            characteristic_id,
            ack.status
        ));
    }
    Ok(())
}

pub async fn disconnect<T: GattTransport>(app_state: &AppState<T>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    app_state.adaptor.disconnect_gatt(Some(Box::new(move |status| {
        let _ = tx.send(status);
    })))?;
    let status = rx.await.map_err(|_| anyhow!("Adaptor dropped the disconnect request"))?;
    info!("Disconnected from {} (status {})", status.peripheral, status.status);
    Ok(())
}

/// Parses a hex payload such as `01ff` or `01:FF`
pub fn parse_hex(payload: &str) -> Result<Vec<u8>> {
    let digits: String = payload
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .collect();
    hex::decode(&digits).map_err(|e| anyhow!("Invalid hex payload {}: {}", payload, e))
}
