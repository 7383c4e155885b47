//! Raw BLE advertisements and the device properties they are built from.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Manufacturer data embedded in an advertisement, keyed by company id.
pub type ManufacturerData = BTreeMap<u16, Vec<u8>>;

/// Ruuvi Innovations company id.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

/// Opaque identifier the transport assigns to a device (a D-Bus object path for BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(pub String);

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// A single device property as reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceProperty {
    Address(MacAddress),
    ManufacturerData(ManufacturerData),
    Rssi(i16),
    /// Any property the tracker does not look at, by name.
    Other(String),
}

/// A BLE advertisement: who sent it and what manufacturer data it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    pub manufacturer_data: ManufacturerData,
}

/// Errors building an advertisement from device properties.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdvertisementError {
    #[error("device properties don't contain an Address")]
    MissingAddress,
}

impl RawAdvertisement {
    /// Build an advertisement from a full device property set.
    ///
    /// The address is required. A missing manufacturer data property yields an
    /// empty map, which keeps the device cacheable but not publishable.
    pub fn from_properties(props: &[DeviceProperty]) -> Result<Self, AdvertisementError> {
        let mut address = None;
        let mut manufacturer_data = ManufacturerData::new();
        for prop in props {
            match prop {
                DeviceProperty::Address(addr) => address = Some(*addr),
                DeviceProperty::ManufacturerData(md) => manufacturer_data = md.clone(),
                DeviceProperty::Rssi(_) | DeviceProperty::Other(_) => {}
            }
        }

        Ok(Self {
            address: address.ok_or(AdvertisementError::MissingAddress)?,
            manufacturer_data,
        })
    }

    /// Whether the advertisement carries anything worth publishing.
    pub fn is_publishable(&self) -> bool {
        !self.manufacturer_data.is_empty()
    }
}
