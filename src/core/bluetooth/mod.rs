//! Bluetooth functionality for the GATT adaptor
//! This module handles all bluetooth operations including scanning,
//! connecting, validating services and exchanging characteristic data.

mod advertisement;
mod capability;
mod commands;
mod connection;
mod constants;
mod device;
mod error;
mod events;
mod identity;
mod manager;
mod notification;
mod scanner;
mod session;
mod transport;
mod types;

#[cfg(feature = "bluest")]
mod bluest_transport;

#[cfg(test)]
pub(crate) mod fake;

// Re-export types that should be publicly accessible
pub use advertisement::{uuid_from_short, AdvertisementData};
pub use capability::{CapabilityCatalog, CharacteristicProperties, ServiceRequirements};
pub use commands::{
    BondCallback, ConnectCallback, DataSink, DisconnectCallback, MtuCallback, ReadCallback, WriteCallback,
};
pub use connection::ConnectOptions;
pub use constants::*; // Re-export all constants
pub use device::{DeviceRecord, DeviceRegistry};
pub use error::{BleError, TransportError};
pub use events::{EventHub, Subscription};
pub use identity::{extract_mac_address, format_mac, parse_mac, MacAddress, PeripheralIdentity};
pub use manager::{parse_uuid, BleAdaptor};
pub use scanner::{FinishedCallback, ScanSession};
pub use session::GattSession;
pub use transport::{
    Advertisement, GattTransport, LinkEvent, LinkEventStream, NotificationStream, RemoteCharacteristic, RemoteService,
    ScanReport, ScanResult, ScanStream,
};
pub use types::{
    AdaptorEvent, ConnectionStatus, GattStatus, MtuResult, Notification, ReadCompletion, ScanEvent, ScanFilter,
    SessionEvent, SessionState, WriteCompletion,
};

#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
