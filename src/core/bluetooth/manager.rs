//! Bluetooth manager for the GATT adaptor
//! This module provides the main interface for bluetooth operations. It owns
//! one scan session and one GATT session, translates string identifiers into
//! typed ones and republishes session events as [`AdaptorEvent`]s.
//! Connection queries answer from the GATT session's own snapshot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::config::AdaptorConfig;
use crate::core::bluetooth::advertisement::uuid_from_short;
use crate::core::bluetooth::capability::CapabilityCatalog;
use crate::core::bluetooth::commands::{
    BondCallback, ConnectCallback, DataSink, DisconnectCallback, MtuCallback, ReadCallback, WriteCallback,
};
use crate::core::bluetooth::connection::ConnectOptions;
use crate::core::bluetooth::device::DeviceRecord;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::events::{EventHub, Subscription};
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::scanner::ScanSession;
use crate::core::bluetooth::session::GattSession;
use crate::core::bluetooth::transport::GattTransport;
use crate::core::bluetooth::types::{AdaptorEvent, ScanEvent, ScanFilter, SessionEvent};
use crate::logging::{EventLogger, LogMessage};
use crate::utils::lock;

struct AdaptorPair<T: GattTransport> {
    scanner: ScanSession<T>,
    session: Arc<GattSession<T>>,
    subscriptions: Vec<Subscription>,
    forwarder: AbortHandle,
}

/// Adaptor facade over one scan session and one GATT session
pub struct BleAdaptor<T: GattTransport> {
    transport: Arc<T>,
    config: AdaptorConfig,
    pair: Mutex<Option<AdaptorPair<T>>>,
    events: EventHub<AdaptorEvent>,
}

impl<T: GattTransport> BleAdaptor<T> {
    pub fn new(transport: Arc<T>, config: AdaptorConfig) -> Self {
        Self {
            transport,
            config,
            pair: Mutex::new(None),
            events: EventHub::new(),
        }
    }

    pub fn config(&self) -> &AdaptorConfig {
        &self.config
    }

    /// Connect options derived from the adaptor config
    pub fn default_connect_options(&self) -> ConnectOptions {
        ConnectOptions::from(&self.config)
    }

    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<AdaptorEvent>) {
        self.events.subscribe()
    }

    pub fn has_adaptor(&self) -> bool {
        lock(&self.pair).is_some()
    }

    /// Creates the scan/GATT session pair if it does not exist yet.
    /// Must be called inside a tokio runtime.
    pub fn create_adaptor(&self) {
        self.sessions();
    }

    /// Tears the session pair down. Internal subscriptions are revoked first,
    /// so nothing is republished once this returns.
    pub fn remove_adaptor(&self) {
        let Some(mut pair) = lock(&self.pair).take() else {
            return;
        };
        info!("Removing bluetooth adaptor");
        for subscription in pair.subscriptions.iter_mut() {
            subscription.revoke();
        }
        pair.forwarder.abort();

        pair.scanner.stop();
        if pair.session.is_connected() {
            let _ = pair.session.disconnect(None);
        }
        pair.session.shutdown();
    }

    fn sessions(&self) -> (ScanSession<T>, Arc<GattSession<T>>) {
        let mut pair = lock(&self.pair);
        if let Some(pair) = pair.as_ref() {
            return (pair.scanner.clone(), pair.session.clone());
        }

        info!("Creating bluetooth adaptor");
        let scanner = ScanSession::new(self.transport.clone());
        let session = Arc::new(GattSession::new(
            self.transport.clone(),
            scanner.registry(),
            self.config.default_mtu,
        ));

        let (scan_subscription, scan_rx) = scanner.subscribe();
        let (session_subscription, session_rx) = session.subscribe();
        let mut subscriptions = vec![scan_subscription, session_subscription];
        let log_rx = if self.config.deep_logging {
            match EventLogger::subscribe_global() {
                Some((subscription, rx)) => {
                    subscriptions.push(subscription);
                    Some(rx)
                }
                None => {
                    warn!("Deep logging requested but the event logger is not installed");
                    None
                }
            }
        } else {
            None
        };

        let forwarder = tokio::spawn(forward_events(
            scan_rx,
            session_rx,
            log_rx,
            self.events.clone(),
        ))
        .abort_handle();

        *pair = Some(AdaptorPair {
            scanner: scanner.clone(),
            session: session.clone(),
            subscriptions,
            forwarder,
        });
        (scanner, session)
    }

    fn scanner(&self) -> ScanSession<T> {
        self.sessions().0
    }

    fn session(&self) -> Arc<GattSession<T>> {
        self.sessions().1
    }

    /// Scans with an optional service filter (UUID string) and manufacturer id (0 = none).
    ///
    /// A running scan is stopped first. Without a duration the scan runs until cancelled.
    pub fn scan(&self, service_id: Option<&str>, manufacturer_id: u16, duration: Option<Duration>) -> Result<(), BleError> {
        let service = service_id.map(parse_uuid).transpose()?;
        let filter = ScanFilter::from_parts(service, manufacturer_id);
        self.scanner().restart(filter, duration, None)
    }

    pub fn scan_single_device(&self, address: &str, duration: Option<Duration>) -> Result<(), BleError> {
        self.scanner().scan_single_device(address, duration, None)
    }

    pub fn cancel_scan(&self) {
        if let Some(pair) = lock(&self.pair).as_ref() {
            pair.scanner.stop();
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.pair).as_ref().is_some_and(|pair| pair.scanner.is_scanning())
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.scanner().devices()
    }

    pub fn set_hardware_identity(
        &self,
        identity: &PeripheralIdentity,
        hardware: PeripheralIdentity,
    ) -> Result<(), BleError> {
        self.scanner().set_hardware_identity(identity, hardware)
    }

    pub fn connect_to_device(
        &self,
        identity: PeripheralIdentity,
        catalog: CapabilityCatalog,
        options: ConnectOptions,
        on_result: Option<ConnectCallback>,
    ) -> Result<(), BleError> {
        let on_result = on_result.unwrap_or_else(|| Box::new(|_| {}));
        self.session().connect(identity, catalog, options, on_result)
    }

    pub fn request_mtu(&self, mtu: u16, on_result: Option<MtuCallback>) -> Result<(), BleError> {
        self.session().set_mtu(mtu, on_result)
    }

    pub fn bond(&self, on_result: Option<BondCallback>) -> Result<(), BleError> {
        self.session().bond(on_result)
    }

    // Connection facts are read from the session snapshot, which the worker
    // updates before any callback or event of the same transition

    pub fn is_connected(&self) -> bool {
        lock(&self.pair).as_ref().is_some_and(|pair| pair.session.is_connected())
    }

    pub fn services_available(&self) -> bool {
        lock(&self.pair)
            .as_ref()
            .is_some_and(|pair| pair.session.services_available())
    }

    /// Negotiated MTU, or the configured default without a link
    pub fn mtu(&self) -> u16 {
        lock(&self.pair)
            .as_ref()
            .map_or(self.config.default_mtu, |pair| pair.session.mtu())
    }

    pub fn connected_device(&self) -> Option<PeripheralIdentity> {
        lock(&self.pair).as_ref().and_then(|pair| pair.session.connected_device())
    }

    pub fn connected_device_name(&self) -> Option<String> {
        lock(&self.pair).as_ref().and_then(|pair| pair.session.connected_device_name())
    }

    pub fn device_services(&self) -> Vec<Uuid> {
        lock(&self.pair)
            .as_ref()
            .map(|pair| pair.session.device_services())
            .unwrap_or_default()
    }

    pub fn disconnect_gatt(&self, on_result: Option<DisconnectCallback>) -> Result<(), BleError> {
        self.session().disconnect(on_result)
    }

    pub fn notify_characteristic(
        &self,
        characteristic_id: &str,
        on_data: Option<DataSink>,
        on_ack: Option<WriteCallback>,
    ) -> Result<(), BleError> {
        let characteristic = parse_uuid(characteristic_id)?;
        self.session().enable_notifications(characteristic, on_data, on_ack)
    }

    pub fn clear_characteristic(&self, characteristic_id: &str, on_ack: Option<WriteCallback>) -> Result<(), BleError> {
        let characteristic = parse_uuid(characteristic_id)?;
        self.session().disable_notifications(characteristic, on_ack)
    }

    pub fn read_characteristic(&self, characteristic_id: &str, on_result: Option<ReadCallback>) -> Result<(), BleError> {
        let characteristic = parse_uuid(characteristic_id)?;
        self.session().read(characteristic, on_result)
    }

    pub fn write_characteristic(
        &self,
        characteristic_id: &str,
        payload: Vec<u8>,
        on_result: Option<WriteCallback>,
    ) -> Result<(), BleError> {
        let characteristic = parse_uuid(characteristic_id)?;
        self.session().write(characteristic, payload, on_result)
    }
}

impl<T: GattTransport> Drop for BleAdaptor<T> {
    fn drop(&mut self) {
        self.remove_adaptor();
    }
}

/// Parses a full UUID string or a 16/32-bit short form such as `2a19`
pub fn parse_uuid(id: &str) -> Result<Uuid, BleError> {
    let trimmed = id.trim();
    let short = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if matches!(short.len(), 4 | 8) {
        if let Ok(value) = u32::from_str_radix(short, 16) {
            return Ok(uuid_from_short(value));
        }
    }
    Uuid::parse_str(trimmed).map_err(|_| BleError::InvalidIdentifier(id.to_string()))
}

async fn forward_events(
    mut scan_rx: UnboundedReceiver<ScanEvent>,
    mut session_rx: UnboundedReceiver<SessionEvent>,
    mut log_rx: Option<UnboundedReceiver<LogMessage>>,
    events: EventHub<AdaptorEvent>,
) {
    // No logging in here: with deep logging on, every record would come back around
    loop {
        let event = tokio::select! {
            Some(event) = scan_rx.recv() => match event {
                ScanEvent::DeviceDiscovered(record) => AdaptorEvent::DeviceDiscovered(record),
                ScanEvent::ScanFailed(code) => AdaptorEvent::ScanFailed(code),
                ScanEvent::DiscoveryFinished => AdaptorEvent::DiscoveryFinished,
            },
            Some(event) = session_rx.recv() => match event {
                SessionEvent::Connected(status) => AdaptorEvent::DeviceConnected(status),
                SessionEvent::Ready(status) => AdaptorEvent::DeviceReady(status),
                SessionEvent::Disconnected(status) => AdaptorEvent::DeviceDisconnected(status),
                SessionEvent::ConnectionFailed(status) => AdaptorEvent::ConnectionFailed(status),
                SessionEvent::Bonded(status) => AdaptorEvent::DeviceBonded(status),
                SessionEvent::MtuChanged(result) => AdaptorEvent::MtuChanged(result),
                SessionEvent::Notification(notification) => AdaptorEvent::CharacteristicNotified(notification),
                SessionEvent::ReadCompleted(completion) => AdaptorEvent::CharacteristicRead(completion),
                SessionEvent::WriteCompleted(completion) => AdaptorEvent::CharacteristicWritten(completion),
            },
            Some(message) = next_log(&mut log_rx) => {
                if !message.is_own() {
                    continue;
                }
                AdaptorEvent::Log(format!("[{}] {}", message.level, message.message))
            },
            else => break,
        };
        events.publish(event);
    }
}

async fn next_log(rx: &mut Option<UnboundedReceiver<LogMessage>>) -> Option<LogMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
