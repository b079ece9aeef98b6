//! Platform transport abstraction
//! The radio and GATT stack are reached only through [`GattTransport`], so the
//! sessions can run against bluest or against a scripted transport in tests.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::core::bluetooth::advertisement::AdvertisementData;
use crate::core::bluetooth::capability::CharacteristicProperties;
use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::types::ScanFilter;

/// One advertisement seen by the radio
#[derive(Debug, Clone)]
pub struct ScanResult<P> {
    /// Platform handle used to connect
    pub peripheral: P,
    pub identity: PeripheralIdentity,
    pub rssi: i16,
    pub advertisement: Advertisement,
}

/// Advertising payload as the platform delivers it
#[derive(Debug, Clone)]
pub enum Advertisement {
    /// Undecoded AD structures, as in a raw scan record
    Raw(Vec<u8>),
    /// Already decoded by the platform stack
    Decoded(AdvertisementData),
}

impl Advertisement {
    pub fn decode(self) -> AdvertisementData {
        match self {
            Self::Raw(bytes) => AdvertisementData::parse(&bytes),
            Self::Decoded(data) => data,
        }
    }
}

/// Item of a scan stream
#[derive(Debug, Clone)]
pub enum ScanReport<P> {
    Result(ScanResult<P>),
    /// The platform aborted the scan with this code
    Failed(i32),
}

/// Link state change reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// A characteristic as reported by the connected peripheral
#[derive(Debug, Clone)]
pub struct RemoteCharacteristic<C> {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub handle: C,
}

/// A service and its characteristics as reported by the connected peripheral
#[derive(Debug, Clone)]
pub struct RemoteService<C> {
    pub uuid: Uuid,
    pub characteristics: Vec<RemoteCharacteristic<C>>,
}

pub type ScanStream<P> = BoxStream<'static, ScanReport<P>>;
pub type NotificationStream = BoxStream<'static, Vec<u8>>;
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Turns a channel receiver into a boxed stream that ends when every sender is gone
pub fn receiver_stream<T: Send + 'static>(rx: UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// GATT request primitives of the platform stack.
///
/// Every call is a single request; retry and sequencing policy belong to the
/// sessions, never to the transport.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Platform device handle
    type Peripheral: Clone + Send + Sync + 'static;
    /// Platform characteristic handle
    type Characteristic: Clone + Send + Sync + 'static;

    /// Starts a platform scan; dropping the stream stops it
    async fn scan(&self, filter: ScanFilter) -> Result<ScanStream<Self::Peripheral>, TransportError>;

    /// One connection attempt, without platform auto-reconnect
    async fn connect(&self, peripheral: &Self::Peripheral) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        peripheral: &Self::Peripheral,
    ) -> Result<Vec<RemoteService<Self::Characteristic>>, TransportError>;

    /// Returns the MTU the link settled on, which may differ from the request
    async fn request_mtu(&self, peripheral: &Self::Peripheral, mtu: u16) -> Result<u16, TransportError>;

    async fn read(&self, characteristic: &Self::Characteristic) -> Result<Vec<u8>, TransportError>;

    /// Writes a value and returns the bytes the stack reports as sent, if it reports any
    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Enables notifications; the stream yields one item per push
    async fn subscribe(&self, characteristic: &Self::Characteristic) -> Result<NotificationStream, TransportError>;

    async fn unsubscribe(&self, characteristic: &Self::Characteristic) -> Result<(), TransportError>;

    async fn bond(&self, peripheral: &Self::Peripheral) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral: &Self::Peripheral) -> Result<(), TransportError>;

    /// Link state changes for one peripheral, whoever caused them
    async fn link_events(&self, peripheral: &Self::Peripheral) -> Result<LinkEventStream, TransportError>;
}
