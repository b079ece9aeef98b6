//! Peripheral identity codec
//! Converts between a 6-byte MAC address and the 128-bit identifier used to
//! correlate platform device handles with session state.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;

/// Number of bytes in a hardware address
pub const MAC_ADDRESS_LEN: usize = 6;

/// A 6-byte hardware address
pub type MacAddress = [u8; MAC_ADDRESS_LEN];

/// Opaque 128-bit peripheral identifier.
///
/// The lower 48 bits hold the MAC address, the upper bits are always zero,
/// so the same physical address always yields the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct PeripheralIdentity(Uuid);

impl PeripheralIdentity {
    /// Builds an identity by left-padding the address with zero bytes
    pub fn from_mac(mac: MacAddress) -> Self {
        let mut bytes = [0u8; 16];
        bytes[16 - MAC_ADDRESS_LEN..].copy_from_slice(&mac);
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the low-order 6 bytes of the identity
    pub fn mac(&self) -> MacAddress {
        let bytes = self.0.as_bytes();
        let mut mac = [0u8; MAC_ADDRESS_LEN];
        mac.copy_from_slice(&bytes[16 - MAC_ADDRESS_LEN..]);
        mac
    }

    /// The identity as a UUID value
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses "AA:BB:CC:DD:EE:FF", "AA-BB-CC-DD-EE-FF" or "AABBCCDDEEFF"
    pub fn parse_address(address: &str) -> Result<Self, BleError> {
        let mac = parse_mac(address)
            .ok_or_else(|| BleError::InvalidIdentifier(address.to_string()))?;
        Ok(Self::from_mac(mac))
    }

    /// Case-insensitive match against either the compact or the colon form
    pub fn matches(&self, address: &str) -> bool {
        let mac = self.mac();
        address.eq_ignore_ascii_case(&format_mac(&mac, false))
            || address.eq_ignore_ascii_case(&format_mac(&mac, true))
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_mac(&self.mac(), true))
    }
}

impl From<MacAddress> for PeripheralIdentity {
    fn from(mac: MacAddress) -> Self {
        Self::from_mac(mac)
    }
}

impl From<PeripheralIdentity> for Uuid {
    fn from(identity: PeripheralIdentity) -> Self {
        identity.0
    }
}

/// Accepts only values whose bits above the 48-bit address are zero
impl TryFrom<Uuid> for PeripheralIdentity {
    type Error = BleError;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        if uuid.as_u128() >> (MAC_ADDRESS_LEN * 8) != 0 {
            return Err(BleError::InvalidIdentifier(uuid.to_string()));
        }
        Ok(Self(uuid))
    }
}

/// Formats an address as uppercase hex, optionally colon-separated
pub fn format_mac(mac: &MacAddress, with_separator: bool) -> String {
    let separator = if with_separator { ":" } else { "" };
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(separator)
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // One separator style per address
        Regex::new(r"^(?:[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{12})$")
            .expect("address pattern is valid")
    })
}

/// Parses an address string into raw bytes
pub fn parse_mac(address: &str) -> Option<MacAddress> {
    let address = address.trim();
    if !address_pattern().is_match(address) {
        return None;
    }
    let digits: String = address.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    hex::decode(digits).ok()?.try_into().ok()
}

/// Pulls the last MAC-looking substring out of a platform device id
pub fn extract_mac_address(device_id: &str) -> Option<MacAddress> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").expect("address pattern is valid")
    });
    re.find_iter(device_id)
        .last()
        .and_then(|m| parse_mac(&m.as_str().replace('_', ":")))
}
