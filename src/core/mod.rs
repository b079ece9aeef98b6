//! Core functionality for the GATT adaptor
//! This module contains the radio-facing components: scanning, the GATT
//! session and the adaptor facade over both.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BleAdaptor, BleError, CapabilityCatalog, PeripheralIdentity};
