//! RuuviTag measurement data structures.

use crate::mac_address::MacAddress;
use serde::Serialize;
use std::time::SystemTime;

/// Ruuvi payload format a measurement was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Legacy fixed-point format, first byte `3`.
    V1,
    /// Compact signed format, first byte `5`.
    V2,
}

/// A measurement decoded from a Ruuvi payload.
///
/// Every field is independently optional: a sentinel in one field never
/// implies absence of another.
///
/// Units:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
/// - Pressure in hectopascals
/// - Acceleration in g (standard gravity), per axis
/// - Battery voltage in Volts
/// - TX power in dBm
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMeasurement {
    pub format: DataFormat,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub acceleration: [Option<f64>; 3],
    pub battery_voltage: Option<f64>,
    pub tx_power: Option<f64>,
    pub movement_counter: Option<u32>,
    pub sequence_number: Option<u32>,
    pub mac: Option<MacAddress>,
}

impl DecodedMeasurement {
    /// A measurement of the given format with every field absent.
    pub fn empty(format: DataFormat) -> Self {
        Self {
            format,
            temperature: None,
            humidity: None,
            pressure: None,
            acceleration: [None; 3],
            battery_voltage: None,
            tx_power: None,
            movement_counter: None,
            sequence_number: None,
            mac: None,
        }
    }
}

/// The measurement shape handed to sinks.
///
/// Absent values are NaN. Only the four climate fields survive flattening.
#[derive(Debug, Clone, Serialize)]
pub struct PublishableMeasurement {
    pub sensor_mac: MacAddress,
    /// When the advertisement was received.
    #[serde(skip)]
    pub timestamp: SystemTime,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub battery_voltage: f64,
}

impl PublishableMeasurement {
    /// Flatten a decoded measurement for publication.
    pub fn new(sensor_mac: MacAddress, timestamp: SystemTime, decoded: &DecodedMeasurement) -> Self {
        Self {
            sensor_mac,
            timestamp,
            temperature: decoded.temperature.unwrap_or(f64::NAN),
            humidity: decoded.humidity.unwrap_or(f64::NAN),
            pressure: decoded.pressure.unwrap_or(f64::NAN),
            battery_voltage: decoded.battery_voltage.unwrap_or(f64::NAN),
        }
    }

    /// Key used to coalesce updates from the same sensor.
    pub fn sensor_id(&self) -> String {
        self.sensor_mac.to_string()
    }
}
