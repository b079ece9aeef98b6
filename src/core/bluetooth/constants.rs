//! Constants used throughout the Bluetooth module
//! Retry policy, MTU bounds and the standard UUIDs used by the CLI catalog.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Number of connection attempts before giving up
pub const CONNECT_RETRIES: u32 = 10;

/// Delay between connection attempts in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// MTU assumed until an exchange succeeds
pub const DEFAULT_MTU: u16 = 20;

/// ATT header bytes not available to a write payload
pub const ATT_HEADER_LEN: u16 = 3;

/// Scan duration used when the caller does not give one, in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 30;
