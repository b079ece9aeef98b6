//! Scripted in-memory transport for tests
//! Records every request and lets a test push scan reports, notifications and
//! link loss at the points it chooses.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::bluetooth::capability::CharacteristicProperties;
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::transport::{
    receiver_stream, Advertisement, GattTransport, LinkEvent, LinkEventStream, NotificationStream,
    RemoteCharacteristic, RemoteService, ScanReport, ScanResult, ScanStream,
};
use crate::core::bluetooth::types::{GattStatus, ScanFilter};
use crate::utils::lock;

/// A request seen by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Scan(ScanFilter),
    Connect(PeripheralIdentity),
    DiscoverServices(PeripheralIdentity),
    RequestMtu(u16),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Bond(PeripheralIdentity),
    Disconnect(PeripheralIdentity),
}

/// How the fake answers a write
#[derive(Debug, Clone)]
pub enum WriteEcho {
    /// Echo the payload back unchanged
    Same,
    Fixed(Vec<u8>),
    Absent,
    Fail(GattStatus),
}

struct FakeState {
    calls: Vec<Call>,
    connect_attempts: Vec<Instant>,
    connect_failures: u32,
    scan_error: Option<TransportError>,
    scan_tx: Option<UnboundedSender<ScanReport<PeripheralIdentity>>>,
    link_tx: Option<UnboundedSender<LinkEvent>>,
    notify_tx: HashMap<Uuid, UnboundedSender<Vec<u8>>>,
    services: Vec<RemoteService<Uuid>>,
    reads: HashMap<Uuid, Vec<u8>>,
    write_echo: WriteEcho,
    negotiated_mtu: Option<u16>,
    bond_status: Option<GattStatus>,
    hold_requests: bool,
}

pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                connect_attempts: Vec::new(),
                connect_failures: 0,
                scan_error: None,
                scan_tx: None,
                link_tx: None,
                notify_tx: HashMap::new(),
                services: Vec::new(),
                reads: HashMap::new(),
                write_echo: WriteEcho::Same,
                negotiated_mtu: None,
                bond_status: None,
                hold_requests: false,
            }),
        }
    }

    /// Adds a characteristic to the fake's GATT table
    pub fn with_characteristic(self, service: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        {
            let mut state = lock(&self.state);
            let characteristic = RemoteCharacteristic {
                uuid,
                properties,
                handle: uuid,
            };
            match state.services.iter_mut().find(|s| s.uuid == service) {
                Some(existing) => existing.characteristics.push(characteristic),
                None => state.services.push(RemoteService {
                    uuid: service,
                    characteristics: vec![characteristic],
                }),
            }
        }
        self
    }

    pub fn fail_connects(&self, count: u32) {
        lock(&self.state).connect_failures = count;
    }

    pub fn fail_scan(&self, status: GattStatus) {
        lock(&self.state).scan_error = Some(TransportError::new(status, "scan rejected"));
    }

    pub fn set_read_value(&self, uuid: Uuid, value: Vec<u8>) {
        lock(&self.state).reads.insert(uuid, value);
    }

    pub fn set_write_echo(&self, echo: WriteEcho) {
        lock(&self.state).write_echo = echo;
    }

    pub fn set_negotiated_mtu(&self, mtu: u16) {
        lock(&self.state).negotiated_mtu = Some(mtu);
    }

    pub fn fail_bond(&self, status: GattStatus) {
        lock(&self.state).bond_status = Some(status);
    }

    /// Leaves reads, writes and subscribes pending forever once they are recorded
    pub fn hold_requests(&self) {
        lock(&self.state).hold_requests = true;
    }

    async fn maybe_hold(&self) {
        let held = lock(&self.state).hold_requests;
        if held {
            std::future::pending::<()>().await;
        }
    }

    /// Delivers an advertisement carrying only a complete local name
    pub fn advertise(&self, mac: [u8; 6], name: &str, rssi: i16) {
        let mut raw = vec![name.len() as u8 + 1, 0x09];
        raw.extend_from_slice(name.as_bytes());
        self.advertise_raw(mac, raw, rssi);
    }

    /// Delivers a raw scan record to the running scan
    pub fn advertise_raw(&self, mac: [u8; 6], raw: Vec<u8>, rssi: i16) {
        let identity = PeripheralIdentity::from_mac(mac);
        self.push_scan_report(ScanReport::Result(ScanResult {
            peripheral: identity,
            identity,
            rssi,
            advertisement: Advertisement::Raw(raw),
        }));
    }

    pub fn push_scan_report(&self, report: ScanReport<PeripheralIdentity>) {
        if let Some(tx) = lock(&self.state).scan_tx.as_ref() {
            let _ = tx.send(report);
        }
    }

    /// Ends the current scan stream as if the platform stopped it
    pub fn end_scan(&self) {
        lock(&self.state).scan_tx = None;
    }

    pub fn notify(&self, uuid: Uuid, data: Vec<u8>) {
        if let Some(tx) = lock(&self.state).notify_tx.get(&uuid) {
            let _ = tx.send(data);
        }
    }

    pub fn drop_link(&self) {
        if let Some(tx) = lock(&self.state).link_tx.take() {
            let _ = tx.send(LinkEvent::Disconnected);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state).connect_attempts.clone()
    }

    fn record(&self, call: Call) {
        lock(&self.state).calls.push(call);
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    type Peripheral = PeripheralIdentity;
    type Characteristic = Uuid;

    async fn scan(&self, filter: ScanFilter) -> Result<ScanStream<PeripheralIdentity>, TransportError> {
        self.record(Call::Scan(filter));
        let mut state = lock(&self.state);
        if let Some(e) = state.scan_error.clone() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.scan_tx = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<(), TransportError> {
        self.record(Call::Connect(*peripheral));
        let mut state = lock(&self.state);
        state.connect_attempts.push(Instant::now());
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::new(GattStatus(133), "connection refused"));
        }
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralIdentity) -> Result<Vec<RemoteService<Uuid>>, TransportError> {
        self.record(Call::DiscoverServices(*peripheral));
        Ok(lock(&self.state).services.clone())
    }

    async fn request_mtu(&self, _peripheral: &PeripheralIdentity, mtu: u16) -> Result<u16, TransportError> {
        self.record(Call::RequestMtu(mtu));
        match lock(&self.state).negotiated_mtu {
            Some(0) => Err(TransportError::failure("mtu exchange rejected")),
            Some(negotiated) => Ok(negotiated),
            None => Ok(mtu),
        }
    }

    async fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>, TransportError> {
        self.record(Call::Read(*characteristic));
        self.maybe_hold().await;
        lock(&self.state)
            .reads
            .get(characteristic)
            .cloned()
            .ok_or_else(|| TransportError::new(GattStatus(2), "read not permitted"))
    }

    async fn write(&self, characteristic: &Uuid, payload: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        self.record(Call::Write(*characteristic, payload.to_vec()));
        self.maybe_hold().await;
        match lock(&self.state).write_echo.clone() {
            WriteEcho::Same => Ok(Some(payload.to_vec())),
            WriteEcho::Fixed(echo) => Ok(Some(echo)),
            WriteEcho::Absent => Ok(None),
            WriteEcho::Fail(status) => Err(TransportError::new(status, "write rejected")),
        }
    }

    async fn subscribe(&self, characteristic: &Uuid) -> Result<NotificationStream, TransportError> {
        self.record(Call::Subscribe(*characteristic));
        self.maybe_hold().await;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).notify_tx.insert(*characteristic, tx);
        Ok(receiver_stream(rx))
    }

    async fn unsubscribe(&self, characteristic: &Uuid) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe(*characteristic));
        lock(&self.state).notify_tx.remove(characteristic);
        Ok(())
    }

    async fn bond(&self, peripheral: &PeripheralIdentity) -> Result<(), TransportError> {
        self.record(Call::Bond(*peripheral));
        match lock(&self.state).bond_status {
            Some(status) => Err(TransportError::new(status, "bonding rejected")),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, peripheral: &PeripheralIdentity) -> Result<(), TransportError> {
        self.record(Call::Disconnect(*peripheral));
        if let Some(tx) = lock(&self.state).link_tx.take() {
            let _ = tx.send(LinkEvent::Disconnected);
        }
        Ok(())
    }

    async fn link_events(&self, _peripheral: &PeripheralIdentity) -> Result<LinkEventStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).link_tx = Some(tx);
        Ok(stream::once(async { LinkEvent::Connected }).chain(receiver_stream(rx)).boxed())
    }
}
