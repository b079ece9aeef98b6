//! Advertising payload decoding.
//!
//! Walks the length/type/value AD structures of a raw advertisement and pulls
//! out the pieces a device record needs: local name, advertised service ids
//! and manufacturer-specific data.

use std::collections::BTreeMap;

use uuid::Uuid;

const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Bluetooth base UUID, used to expand 16 and 32-bit service ids
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expands a 16 or 32-bit assigned number into a full UUID
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Decoded advertisement contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    /// Company id -> manufacturer payload
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub services: Vec<Uuid>,
}

impl AdvertisementData {
    /// Parses raw AD structures. Truncated trailing structures are ignored.
    pub fn parse(raw: &[u8]) -> Self {
        let mut data = Self::default();
        let mut i = 0;

        while i < raw.len() {
            let len = raw[i] as usize;
            if len == 0 || i + 1 + len > raw.len() {
                break;
            }
            let ad_type = raw[i + 1];
            let value = &raw[i + 2..i + 1 + len];

            match ad_type {
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                    for chunk in value.chunks_exact(2) {
                        let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                        data.push_service(uuid_from_short(short as u32));
                    }
                }
                AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                    for chunk in value.chunks_exact(4) {
                        let short = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        data.push_service(uuid_from_short(short));
                    }
                }
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                    for chunk in value.chunks_exact(16) {
                        let mut bytes = [0u8; 16];
                        bytes.copy_from_slice(chunk);
                        // Over the air the 128-bit id is little-endian
                        bytes.reverse();
                        data.push_service(Uuid::from_bytes(bytes));
                    }
                }
                AD_SHORT_NAME | AD_COMPLETE_NAME => {
                    // A complete name wins over a shortened one
                    if data.local_name.is_none() || ad_type == AD_COMPLETE_NAME {
                        data.local_name = Some(String::from_utf8_lossy(value).into_owned());
                    }
                }
                AD_MANUFACTURER_DATA if value.len() >= 2 => {
                    let company_id = u16::from_le_bytes([value[0], value[1]]);
                    data.manufacturer_data
                        .entry(company_id)
                        .or_insert_with(|| value[2..].to_vec());
                }
                _ => {}
            }

            i += len + 1;
        }

        data
    }

    fn push_service(&mut self, uuid: Uuid) {
        if !self.services.contains(&uuid) {
            self.services.push(uuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_short_ids_against_base_uuid() {
        assert_eq!(
            uuid_from_short(0x180F),
            Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb)
        );
    }

    #[test]
    fn decodes_name_services_and_manufacturer_data() {
        let raw = [
            0x02, 0x01, 0x06, // flags
            0x05, 0x03, 0x0F, 0x18, 0xF0, 0xFF, // battery + 0xFFF0
            0x05, 0x09, b'B', b'e', b'a', b'c', // "Beac"
            0x05, 0xFF, 0x59, 0x00, 0xAA, 0xBB, // Nordic (0x0059)
        ];
        let data = AdvertisementData::parse(&raw);
        assert_eq!(data.local_name.as_deref(), Some("Beac"));
        assert_eq!(
            data.services,
            vec![uuid_from_short(0x180F), uuid_from_short(0xFFF0)]
        );
        assert_eq!(data.manufacturer_data.get(&0x0059), Some(&vec![0xAA, 0xBB]));
    }

    #[test]
    fn decodes_128_bit_service_ids() {
        let uuid = Uuid::from_u128(0x4f63756c_7573_2054_6872_65656d6f7465);
        let mut le = *uuid.as_bytes();
        le.reverse();
        let mut raw = vec![17, AD_COMPLETE_UUID128];
        raw.extend_from_slice(&le);
        assert_eq!(AdvertisementData::parse(&raw).services, vec![uuid]);
    }

    #[test]
    fn truncated_structures_are_ignored() {
        let raw = [0x03, 0x09, b'O', b'K', 0x09, 0xFF, 0x01];
        let data = AdvertisementData::parse(&raw);
        assert_eq!(data.local_name.as_deref(), Some("OK"));
        assert!(data.manufacturer_data.is_empty());
        assert_eq!(AdvertisementData::parse(&[]), AdvertisementData::default());
    }
}
