//! GATT adaptor library
//! A client-side BLE GATT driver: discovery, connection with retries,
//! capability validation and queued characteristic operations.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
