//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::device::DeviceRecord;
use crate::core::bluetooth::identity::{MacAddress, PeripheralIdentity};

/// Raw GATT status as reported by the platform. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: Self = Self(0);
    /// Catch-all failure status of the Android stack (GATT_FAILURE)
    pub const FAILURE: Self = Self(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scan filter. At most one filter category is active per scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanFilter {
    #[default]
    None,
    Service(Uuid),
    /// Manufacturer (company) id, zero is treated as no filter
    Manufacturer(u16),
    Address(MacAddress),
}

impl ScanFilter {
    /// Builds a filter from the UI-level inputs; the service id takes priority
    pub fn from_parts(service_id: Option<Uuid>, manufacturer_id: u16) -> Self {
        match (service_id, manufacturer_id) {
            (Some(uuid), _) => Self::Service(uuid),
            (None, 0) => Self::None,
            (None, id) => Self::Manufacturer(id),
        }
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        match self {
            Self::None | Self::Manufacturer(0) => true,
            Self::Service(uuid) => record.services.contains(uuid),
            Self::Manufacturer(id) => record.manufacturer_data.contains_key(id),
            Self::Address(mac) => record.identity.mac() == *mac,
        }
    }
}

/// GATT session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ValidatingServices,
    Ready,
    Disconnecting,
}

/// Result of an MTU exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MtuResult {
    /// Negotiated value on success, last known value on failure
    pub mtu: u16,
    pub success: bool,
    pub status: GattStatus,
}

/// Completion of a characteristic read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadCompletion {
    pub peripheral: Option<PeripheralIdentity>,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub status: GattStatus,
}

impl ReadCompletion {
    pub fn success(&self) -> bool {
        self.status.is_success()
    }
}

/// Completion of a characteristic write, or of a notification enable/disable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteCompletion {
    pub peripheral: Option<PeripheralIdentity>,
    pub characteristic: Uuid,
    pub success: bool,
    pub bytes_written: usize,
    pub status: GattStatus,
}

/// A value pushed by the peripheral on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub peripheral: PeripheralIdentity,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

/// Connection lifecycle report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub peripheral: PeripheralIdentity,
    pub status: GattStatus,
}

/// Events published by the GATT session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    Connected(ConnectionStatus),
    Ready(ConnectionStatus),
    Disconnected(ConnectionStatus),
    ConnectionFailed(ConnectionStatus),
    Bonded(ConnectionStatus),
    MtuChanged(MtuResult),
    Notification(Notification),
    ReadCompleted(ReadCompletion),
    WriteCompleted(WriteCompletion),
}

/// Events published by the scan session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanEvent {
    DeviceDiscovered(DeviceRecord),
    ScanFailed(i32),
    DiscoveryFinished,
}

/// Events published by the adaptor to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AdaptorEvent {
    DeviceDiscovered(DeviceRecord),
    DiscoveryFinished,
    ScanFailed(i32),
    DeviceConnected(ConnectionStatus),
    DeviceReady(ConnectionStatus),
    DeviceDisconnected(ConnectionStatus),
    ConnectionFailed(ConnectionStatus),
    DeviceBonded(ConnectionStatus),
    MtuChanged(MtuResult),
    CharacteristicNotified(Notification),
    CharacteristicRead(ReadCompletion),
    CharacteristicWritten(WriteCompletion),
    Log(String),
}
