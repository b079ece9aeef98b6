//! Characteristic capability flags and the caller-declared capability catalog.
//! The catalog lists every service/characteristic a session is going to use,
//! and connecting validates the peripheral against it before it is usable.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::transport::RemoteService;

/// Bit-flag set of GATT characteristic properties.
///
/// Values follow the Bluetooth Core property byte, so they can be combined and
/// stored in catalog files as plain integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const NONE: Self = Self(0);
    pub const BROADCAST: Self = Self(1);
    pub const READ: Self = Self(1 << 1);
    pub const WRITE_NO_RESPONSE: Self = Self(1 << 2);
    pub const WRITE: Self = Self(1 << 3);
    pub const NOTIFY: Self = Self(1 << 4);
    pub const INDICATE: Self = Self(1 << 5);
    pub const SIGNED_WRITE: Self = Self(1 << 6);
    pub const EXTENDED_PROPS: Self = Self(1 << 7);

    const NAMED: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_NO_RESPONSE, "write-without-response"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
        (Self::SIGNED_WRITE, "signed-write"),
        (Self::EXTENDED_PROPS, "extended"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_broadcast(self) -> bool {
        self.contains(Self::BROADCAST)
    }

    pub fn has_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn has_write_no_response(self) -> bool {
        self.contains(Self::WRITE_NO_RESPONSE)
    }

    pub fn has_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn has_notify(self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn has_indicate(self) -> bool {
        self.contains(Self::INDICATE)
    }

    pub fn has_signed_write(self) -> bool {
        self.contains(Self::SIGNED_WRITE)
    }

    pub fn has_extended_props(self) -> bool {
        self.contains(Self::EXTENDED_PROPS)
    }

    /// Required flags that `reported` does not provide.
    ///
    /// Every required capability is checked on its own, so a requirement of
    /// `READ | NOTIFY` fails if either one is missing.
    pub fn missing_from(self, reported: Self) -> Self {
        let checks: [(fn(Self) -> bool, Self); 8] = [
            (Self::has_broadcast, Self::BROADCAST),
            (Self::has_read, Self::READ),
            (Self::has_write_no_response, Self::WRITE_NO_RESPONSE),
            (Self::has_write, Self::WRITE),
            (Self::has_notify, Self::NOTIFY),
            (Self::has_indicate, Self::INDICATE),
            (Self::has_signed_write, Self::SIGNED_WRITE),
            (Self::has_extended_props, Self::EXTENDED_PROPS),
        ];
        checks
            .iter()
            .filter(|(has, _)| has(self) && !has(reported))
            .fold(Self::NONE, |acc, (_, flag)| acc | *flag)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharacteristicProperties({})", self)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// The characteristics required from one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequirements {
    pub service: Uuid,
    /// Characteristic id -> required capability flags
    pub characteristics: BTreeMap<Uuid, CharacteristicProperties>,
}

impl ServiceRequirements {
    pub fn new(service: Uuid) -> Self {
        Self {
            service,
            characteristics: BTreeMap::new(),
        }
    }

    /// Adds a characteristic; returns false if it was already declared
    pub fn add_characteristic(&mut self, characteristic: Uuid, required: CharacteristicProperties) -> bool {
        if self.characteristics.contains_key(&characteristic) {
            return false;
        }
        self.characteristics.insert(characteristic, required);
        true
    }

    /// Builder-style variant of [`Self::add_characteristic`]
    pub fn with_characteristic(mut self, characteristic: Uuid, required: CharacteristicProperties) -> Self {
        self.add_characteristic(characteristic, required);
        self
    }
}

/// Ordered list of services the caller intends to use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityCatalog {
    services: Vec<ServiceRequirements>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceRequirements) -> Self {
        self.add_service(service);
        self
    }

    /// Adds a service, merging characteristics into an existing entry for the same id
    pub fn add_service(&mut self, service: ServiceRequirements) {
        match self.services.iter_mut().find(|s| s.service == service.service) {
            Some(existing) => {
                for (characteristic, required) in service.characteristics {
                    existing.add_characteristic(characteristic, required);
                }
            }
            None => self.services.push(service),
        }
    }

    pub fn services(&self) -> &[ServiceRequirements] {
        &self.services
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Looks up the required flags of a characteristic in any service
    pub fn required(&self, characteristic: &Uuid) -> Option<CharacteristicProperties> {
        self.services
            .iter()
            .find_map(|s| s.characteristics.get(characteristic).copied())
    }

    /// Checks the peripheral's services against the catalog.
    ///
    /// Returns the platform handle of every declared characteristic, or the
    /// first incompatibility found.
    pub fn validate<C: Clone>(&self, remote: &[RemoteService<C>]) -> Result<HashMap<Uuid, C>, BleError> {
        let mut resolved: HashMap<Uuid, C> = HashMap::new();

        for requirements in &self.services {
            let service = remote
                .iter()
                .find(|s| s.uuid == requirements.service)
                .ok_or(BleError::RequiredServiceMissing {
                    service: requirements.service,
                    characteristic: None,
                })?;

            for (uuid, required) in &requirements.characteristics {
                if resolved.contains_key(uuid) {
                    continue;
                }
                let characteristic = service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == *uuid)
                    .ok_or(BleError::RequiredServiceMissing {
                        service: requirements.service,
                        characteristic: Some(*uuid),
                    })?;

                let missing = required.missing_from(characteristic.properties);
                if !missing.is_empty() {
                    return Err(BleError::CharacteristicCapabilityMismatch {
                        characteristic: *uuid,
                        required: *required,
                        reported: characteristic.properties,
                    });
                }
                resolved.insert(*uuid, characteristic.handle.clone());
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::transport::RemoteCharacteristic;

    const SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
    const PASSWORD: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
    const BEACON: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);

    fn remote(props: CharacteristicProperties) -> Vec<RemoteService<u16>> {
        vec![RemoteService {
            uuid: SERVICE,
            characteristics: vec![
                RemoteCharacteristic { uuid: PASSWORD, properties: props, handle: 7 },
                RemoteCharacteristic {
                    uuid: BEACON,
                    properties: CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                    handle: 9,
                },
            ],
        }]
    }

    #[test]
    fn bitmask_values_match_property_byte() {
        assert_eq!(CharacteristicProperties::BROADCAST.bits(), 1);
        assert_eq!(CharacteristicProperties::READ.bits(), 2);
        assert_eq!(CharacteristicProperties::WRITE_NO_RESPONSE.bits(), 4);
        assert_eq!(CharacteristicProperties::WRITE.bits(), 8);
        assert_eq!(CharacteristicProperties::NOTIFY.bits(), 16);
        assert_eq!(CharacteristicProperties::INDICATE.bits(), 32);
        assert_eq!(CharacteristicProperties::SIGNED_WRITE.bits(), 64);
        assert_eq!(CharacteristicProperties::EXTENDED_PROPS.bits(), 128);
    }

    #[test]
    fn each_required_flag_checked_independently() {
        let required = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        let reported = CharacteristicProperties::READ | CharacteristicProperties::WRITE;
        assert_eq!(required.missing_from(reported), CharacteristicProperties::NOTIFY);
        assert!(required
            .missing_from(reported | CharacteristicProperties::NOTIFY)
            .is_empty());
        assert_eq!(required.to_string(), "read|notify");
    }

    #[test]
    fn validation_resolves_handles() {
        let catalog = CapabilityCatalog::new().with_service(
            ServiceRequirements::new(SERVICE)
                .with_characteristic(PASSWORD, CharacteristicProperties::READ)
                .with_characteristic(BEACON, CharacteristicProperties::READ | CharacteristicProperties::WRITE),
        );
        let handles = catalog.validate(&remote(CharacteristicProperties::READ)).unwrap();
        assert_eq!(handles.get(&PASSWORD), Some(&7));
        assert_eq!(handles.get(&BEACON), Some(&9));
    }

    #[test]
    fn missing_notify_is_a_mismatch() {
        let catalog = CapabilityCatalog::new().with_service(
            ServiceRequirements::new(SERVICE).with_characteristic(PASSWORD, CharacteristicProperties::NOTIFY),
        );
        let err = catalog.validate(&remote(CharacteristicProperties::READ)).unwrap_err();
        assert!(matches!(
            err,
            BleError::CharacteristicCapabilityMismatch { characteristic, .. } if characteristic == PASSWORD
        ));
    }

    #[test]
    fn absent_service_or_characteristic_fails() {
        let other = Uuid::from_u128(0x1234);
        let catalog = CapabilityCatalog::new().with_service(ServiceRequirements::new(other));
        assert!(matches!(
            catalog.validate(&remote(CharacteristicProperties::READ)),
            Err(BleError::RequiredServiceMissing { characteristic: None, .. })
        ));

        let catalog = CapabilityCatalog::new().with_service(
            ServiceRequirements::new(SERVICE).with_characteristic(other, CharacteristicProperties::READ),
        );
        assert!(matches!(
            catalog.validate(&remote(CharacteristicProperties::READ)),
            Err(BleError::RequiredServiceMissing { characteristic: Some(c), .. }) if c == other
        ));
    }

    #[test]
    fn duplicate_declarations_merge() {
        let mut service = ServiceRequirements::new(SERVICE);
        assert!(service.add_characteristic(PASSWORD, CharacteristicProperties::READ));
        assert!(!service.add_characteristic(PASSWORD, CharacteristicProperties::WRITE));

        let mut catalog = CapabilityCatalog::new();
        catalog.add_service(service);
        catalog.add_service(ServiceRequirements::new(SERVICE).with_characteristic(BEACON, CharacteristicProperties::WRITE));
        assert_eq!(catalog.services().len(), 1);
        assert_eq!(catalog.required(&PASSWORD), Some(CharacteristicProperties::READ));
        assert_eq!(catalog.required(&BEACON), Some(CharacteristicProperties::WRITE));
    }

    #[test]
    fn catalog_json_uses_integer_bitmasks() {
        let json = r#"[{"service":"0000fff0-0000-1000-8000-00805f9b34fb",
            "characteristics":{"0000fff1-0000-1000-8000-00805f9b34fb":18}}]"#;
        let catalog: CapabilityCatalog = serde_json::from_str(json).unwrap();
        assert_eq!(
            catalog.required(&PASSWORD),
            Some(CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)
        );
    }
}
