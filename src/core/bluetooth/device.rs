//! Bluetooth device representation and related functionality

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::advertisement::AdvertisementData;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::identity::{format_mac, PeripheralIdentity};
use crate::utils::lock;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Identity used for connecting, derived from the MAC address
    pub identity: PeripheralIdentity,
    /// The advertised name, empty if none was advertised
    pub name: String,
    /// The signal strength (RSSI) in dBm
    pub rssi: i16,
    /// Manufacturer id -> manufacturer-specific payload
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Advertised service ids
    pub services: HashSet<Uuid>,
    /// Identity parsed by the caller from advertising payloads, if any
    hardware_identity: Option<PeripheralIdentity>,
}

impl DeviceRecord {
    /// Creates a record from one decoded advertisement
    pub fn new(identity: PeripheralIdentity, rssi: i16, adv: AdvertisementData) -> Self {
        Self {
            identity,
            name: adv.local_name.unwrap_or_default(),
            rssi,
            manufacturer_data: adv.manufacturer_data,
            services: adv.services.into_iter().collect(),
            hardware_identity: None,
        }
    }

    /// The hardware identity, falling back to the connection identity
    pub fn hardware_identity(&self) -> PeripheralIdentity {
        self.hardware_identity.unwrap_or(self.identity)
    }

    pub fn has_hardware_identity(&self) -> bool {
        self.hardware_identity.is_some()
    }

    /// Sets the hardware identity; returns false if it was already set
    pub(crate) fn set_hardware_identity(&mut self, hardware: PeripheralIdentity) -> bool {
        if self.hardware_identity.is_some() {
            return false;
        }
        self.hardware_identity = Some(hardware);
        true
    }

    /// Colon-separated form of the hardware identity
    pub fn short_id(&self) -> String {
        format_mac(&self.hardware_identity().mac(), true)
    }

    /// Compact form of the hardware identity
    pub fn super_short_id(&self) -> String {
        format_mac(&self.hardware_identity().mac(), false)
    }

    /// First manufacturer id present, or 0 when there is none
    pub fn manufacturer_id(&self) -> u16 {
        self.manufacturer_data.keys().next().copied().unwrap_or(0)
    }
}

struct RegistryEntry<P> {
    record: DeviceRecord,
    peripheral: P,
}

struct RegistryInner<P> {
    /// Identities in first-seen order
    order: Vec<PeripheralIdentity>,
    entries: HashMap<PeripheralIdentity, RegistryEntry<P>>,
}

/// Devices found by the current scan, shared between the scan and GATT sessions
pub struct DeviceRegistry<P> {
    inner: Arc<Mutex<RegistryInner<P>>>,
}

impl<P> Clone for DeviceRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Clone> Default for DeviceRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone> DeviceRegistry<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                order: Vec::new(),
                entries: HashMap::new(),
            })),
        }
    }

    /// Stores the record unless the identity is already known; the first record wins
    pub fn insert(&self, record: DeviceRecord, peripheral: P) -> bool {
        let mut inner = lock(&self.inner);
        if inner.entries.contains_key(&record.identity) {
            return false;
        }
        inner.order.push(record.identity);
        inner
            .entries
            .insert(record.identity, RegistryEntry { record, peripheral });
        true
    }

    pub fn contains(&self, identity: &PeripheralIdentity) -> bool {
        lock(&self.inner).entries.contains_key(identity)
    }

    pub fn record(&self, identity: &PeripheralIdentity) -> Option<DeviceRecord> {
        lock(&self.inner).entries.get(identity).map(|e| e.record.clone())
    }

    pub fn peripheral(&self, identity: &PeripheralIdentity) -> Option<P> {
        lock(&self.inner)
            .entries
            .get(identity)
            .map(|e| e.peripheral.clone())
    }

    /// Snapshot of all records in discovery order
    pub fn records(&self) -> Vec<DeviceRecord> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| e.record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.order.clear();
        inner.entries.clear();
    }

    pub fn set_hardware_identity(
        &self,
        identity: &PeripheralIdentity,
        hardware: PeripheralIdentity,
    ) -> Result<(), BleError> {
        let mut inner = lock(&self.inner);
        let entry = inner
            .entries
            .get_mut(identity)
            .ok_or(BleError::NoSuchPeripheral(*identity))?;
        if entry.record.set_hardware_identity(hardware) {
            Ok(())
        } else {
            Err(BleError::HardwareIdentityAlreadySet(*identity))
        }
    }
}
