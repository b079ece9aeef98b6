//! Error types for the Bluetooth module

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::capability::CharacteristicProperties;
use crate::core::bluetooth::identity::PeripheralIdentity;
use crate::core::bluetooth::types::GattStatus;

/// A failed request reported by the platform transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (status {status})")]
pub struct TransportError {
    /// Raw platform status, zero is never used for a failure
    pub status: GattStatus,
    pub message: String,
}

impl TransportError {
    pub fn new(status: GattStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A generic failure carrying the stack's catch-all status
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(GattStatus::FAILURE, message)
    }
}

/// Errors surfaced by the scan session, the GATT session and the adaptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("peripheral {0} was not found by the current scan")]
    NoSuchPeripheral(PeripheralIdentity),

    #[error("a scan is already running")]
    AlreadyScanning,

    #[error("scan failed with code {0}")]
    ScanFailed(i32),

    #[error("connection failed after retries: {0}")]
    ConnectFailed(TransportError),

    #[error("required service {service} is missing (characteristic {characteristic:?})")]
    RequiredServiceMissing {
        service: Uuid,
        characteristic: Option<Uuid>,
    },

    #[error("characteristic {characteristic} requires {required} but reports {reported}")]
    CharacteristicCapabilityMismatch {
        characteristic: Uuid,
        required: CharacteristicProperties,
        reported: CharacteristicProperties,
    },

    #[error("characteristic {0} not loaded")]
    CharacteristicNotLoaded(Uuid),

    #[error("GATT request failed with status {0}")]
    GattStatusError(GattStatus),

    #[error("a connection is already active or in progress")]
    AlreadyConnected,

    #[error("no device connected")]
    NotConnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("hardware identity already set for {0}")]
    HardwareIdentityAlreadySet(PeripheralIdentity),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BleError {
    /// Status code reported to completion callbacks for this error
    pub fn status(&self) -> GattStatus {
        match self {
            Self::GattStatusError(status) => *status,
            Self::Transport(e) | Self::ConnectFailed(e) => e.status,
            _ => GattStatus::FAILURE,
        }
    }
}
