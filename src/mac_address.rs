//! Hardware address of a broadcasting sensor.
//!
//! Used both for the advertiser address reported by the transport and for the
//! address embedded in V2 payloads. Kept independent of any Bluetooth library
//! so the decoder and the tracker can be tested without one.

use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 6-byte hardware address, displayed as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-ones address. V2 payloads use it to mark the address as absent.
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Build an address from a slice that must be exactly 6 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 parts, got {0}")]
    InvalidLength(usize),
    #[error("invalid MAC address: part {0} has wrong length")]
    InvalidPartLength(usize),
    #[error("invalid MAC address: '{0}' is not valid hex")]
    InvalidHex(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `:` separated octets (as BlueZ reports them) and `_` separated
    /// octets (as they appear in BlueZ object paths).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '_']).collect();
        if parts.len() != 6 {
            return Err(ParseMacError::InvalidLength(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseMacError::InvalidPartLength(i));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidHex(part.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<MacAddress> for bluer::Address {
    fn from(addr: MacAddress) -> Self {
        bluer::Address(addr.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr = MacAddress([0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F]);
        assert_eq!(addr.to_string(), "CB:B8:33:4C:88:4F");
    }

    #[test]
    fn test_display_pads_zeros() {
        let addr = MacAddress([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(addr.to_string(), "00:01:02:03:04:05");
    }

    #[test]
    fn test_from_str_colons_and_underscores() {
        let colon: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let underscore: MacAddress = "AA_BB_CC_DD_EE_FF".parse().unwrap();
        assert_eq!(colon, underscore);
        assert_eq!(colon.0, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_from_str_invalid() {
        assert_eq!(
            "invalid".parse::<MacAddress>(),
            Err(ParseMacError::InvalidLength(1))
        );
        assert_eq!(
            "AA:BB:CCC:DD:EE:FF".parse::<MacAddress>(),
            Err(ParseMacError::InvalidPartLength(2))
        );
        assert!(matches!(
            "AA:BB:CC:DD:EE:GG".parse::<MacAddress>(),
            Err(ParseMacError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_from_slice_requires_six_bytes() {
        assert_eq!(
            MacAddress::from_slice(&[0xFF; 6]),
            Some(MacAddress::BROADCAST)
        );
        assert_eq!(MacAddress::from_slice(&[0x01; 5]), None);
    }

    #[test]
    fn test_serializes_as_string() {
        let addr = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(
            serde_json::to_string(&addr).unwrap(),
            "\"AA:BB:CC:DD:EE:FF\""
        );
    }
}
