//! Decoder for Ruuvi manufacturer data payloads.
//!
//! Two wire formats are supported, both big-endian with a fixed length:
//!
//! - format `3` (V1, "RAWv1"): 14 bytes of fixed-point values without sentinels,
//!   only the temperature can be absent.
//! - format `5` (V2, "RAWv2"): 24 bytes where each field has its own
//!   "not available" sentinel.
//!
//! See <https://github.com/ruuvi/ruuvi-sensor-protocols>.

use crate::mac_address::MacAddress;
use crate::measurement::{DataFormat, DecodedMeasurement};
use thiserror::Error;

const V1_FORMAT: u8 = 3;
const V2_FORMAT: u8 = 5;

const V1_LENGTH: usize = 14;
const V2_LENGTH: usize = 24;

/// Errors decoding a Ruuvi payload. None of them are fatal to the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("unsupported format {0}, only formats 3 (RAWv1) and 5 (RAWv2) are supported")]
    UnsupportedFormat(u8),
    #[error("format {format} payload must be exactly {expected} bytes, got {actual}")]
    InvalidLength {
        format: u8,
        expected: usize,
        actual: usize,
    },
}

/// Decode a Ruuvi manufacturer data payload (without the company id prefix).
///
/// Pure and stateless, safe to call from any task.
pub fn decode(data: &[u8]) -> Result<DecodedMeasurement, DecodeError> {
    match data.first() {
        None => Err(DecodeError::Empty),
        Some(&V1_FORMAT) => decode_v1(data),
        Some(&V2_FORMAT) => decode_v2(data),
        Some(&other) => Err(DecodeError::UnsupportedFormat(other)),
    }
}

fn check_length(data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidLength {
            format: data[0],
            expected,
            actual: data.len(),
        })
    }
}

#[inline]
fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn i16_at(data: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([data[offset], data[offset + 1]])
}

/// `None` when `raw` equals the field's sentinel, otherwise the converted value.
#[inline]
fn unless<T: PartialEq, U>(raw: T, sentinel: T, convert: impl FnOnce(T) -> U) -> Option<U> {
    if raw == sentinel {
        None
    } else {
        Some(convert(raw))
    }
}

fn pressure_hpa(raw: u16) -> f64 {
    (f64::from(raw) + 50_000.0) / 100.0
}

fn milli(raw: i16) -> f64 {
    f64::from(raw) / 1000.0
}

// Layout: format, humidity, temperature, temperature fraction, pressure(2),
// acceleration x/y/z (2 each), battery mV(2).
fn decode_v1(data: &[u8]) -> Result<DecodedMeasurement, DecodeError> {
    check_length(data, V1_LENGTH)?;

    let humidity = data[1];
    let temperature = data[2];
    let fraction = data[3];

    // Sign-magnitude integer part, fraction in hundredths.
    let temperature = (fraction < 100).then(|| {
        let value = f64::from(temperature & 0x7F) + f64::from(fraction) / 100.0;
        if temperature & 0x80 != 0 { -value } else { value }
    });

    Ok(DecodedMeasurement {
        temperature,
        humidity: Some(f64::from(humidity) / 2.0),
        pressure: Some(pressure_hpa(u16_at(data, 4))),
        acceleration: [
            Some(milli(i16_at(data, 6))),
            Some(milli(i16_at(data, 8))),
            Some(milli(i16_at(data, 10))),
        ],
        battery_voltage: Some(f64::from(u16_at(data, 12)) / 1000.0),
        ..DecodedMeasurement::empty(DataFormat::V1)
    })
}

// Layout: format, temperature(2), humidity(2), pressure(2), acceleration
// x/y/z (2 each), power info(2), movement counter, sequence number(2), mac(6).
fn decode_v2(data: &[u8]) -> Result<DecodedMeasurement, DecodeError> {
    check_length(data, V2_LENGTH)?;

    let power_info = u16_at(data, 13);
    let battery = power_info >> 5;
    let tx_power = power_info & 0x1F;

    let mac = MacAddress::from_slice(&data[18..24]).filter(|mac| *mac != MacAddress::BROADCAST);

    Ok(DecodedMeasurement {
        format: DataFormat::V2,
        temperature: unless(i16_at(data, 1), i16::MIN, |t| f64::from(t) * 0.005),
        humidity: unless(u16_at(data, 3), u16::MAX, |h| f64::from(h) * 0.0025),
        pressure: unless(u16_at(data, 5), u16::MAX, pressure_hpa),
        acceleration: [
            unless(i16_at(data, 7), i16::MIN, milli),
            unless(i16_at(data, 9), i16::MIN, milli),
            unless(i16_at(data, 11), i16::MIN, milli),
        ],
        battery_voltage: unless(battery, 2047, |b| (f64::from(b) + 1600.0) / 1000.0),
        tx_power: unless(tx_power, 31, |t| f64::from(t) * 2.0 - 40.0),
        movement_counter: unless(data[15], u8::MAX, u32::from),
        sequence_number: unless(u16_at(data, 16), u16::MAX, u32::from),
        mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::hex;

    fn assert_close(field: &str, value: Option<f64>, expected: Option<f64>) {
        match (value, expected) {
            (Some(v), Some(e)) => assert!((v - e).abs() < 1e-4, "{field}: got {v}, expected {e}"),
            (None, None) => {}
            _ => panic!("{field}: got {value:?}, expected {expected:?}"),
        }
    }

    #[test]
    fn test_v2_valid() {
        let m = decode(&hex("0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F")).unwrap();
        assert_eq!(m.format, DataFormat::V2);
        assert_close("temperature", m.temperature, Some(24.3));
        assert_close("humidity", m.humidity, Some(53.49));
        assert_close("pressure", m.pressure, Some(1000.44));
        assert_close("acceleration x", m.acceleration[0], Some(0.004));
        assert_close("acceleration y", m.acceleration[1], Some(-0.004));
        assert_close("acceleration z", m.acceleration[2], Some(1.036));
        assert_close("tx power", m.tx_power, Some(4.0));
        assert_close("battery", m.battery_voltage, Some(2.977));
        assert_eq!(m.movement_counter, Some(66));
        assert_eq!(m.sequence_number, Some(205));
        assert_eq!(
            m.mac,
            Some(MacAddress([0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F]))
        );
    }

    #[test]
    fn test_v2_maximum() {
        let m = decode(&hex("057FFFFFFEFFFE7FFF7FFF7FFFFFDEFEFFFECBB8334C884F")).unwrap();
        assert_close("temperature", m.temperature, Some(163.835));
        assert_close("humidity", m.humidity, Some(163.835));
        assert_close("pressure", m.pressure, Some(1155.34));
        for axis in m.acceleration {
            assert_close("acceleration", axis, Some(32.767));
        }
        assert_close("tx power", m.tx_power, Some(20.0));
        assert_close("battery", m.battery_voltage, Some(3.646));
        assert_eq!(m.movement_counter, Some(254));
        assert_eq!(m.sequence_number, Some(65534));
    }

    #[test]
    fn test_v2_minimum() {
        let m = decode(&hex("058001000000008001800180010000000000CBB8334C884F")).unwrap();
        assert_close("temperature", m.temperature, Some(-163.835));
        assert_close("humidity", m.humidity, Some(0.0));
        assert_close("pressure", m.pressure, Some(500.0));
        for axis in m.acceleration {
            assert_close("acceleration", axis, Some(-32.767));
        }
        assert_close("tx power", m.tx_power, Some(-40.0));
        assert_close("battery", m.battery_voltage, Some(1.6));
        assert_eq!(m.movement_counter, Some(0));
        assert_eq!(m.sequence_number, Some(0));
    }

    #[test]
    fn test_v2_all_sentinels_are_absent() {
        let m = decode(&hex("058000FFFFFFFF800080008000FFFFFFFFFFFFFFFFFFFFFF")).unwrap();
        assert_eq!(m, DecodedMeasurement::empty(DataFormat::V2));
    }

    #[test]
    fn test_v2_sentinels_are_independent() {
        // Only acceleration y and the battery half of power info are unavailable.
        let m = decode(&hex("0512FC5394C37C00048000040CFFF64200CDCBB8334C884F")).unwrap();
        assert_close("acceleration x", m.acceleration[0], Some(0.004));
        assert_close("acceleration y", m.acceleration[1], None);
        assert_close("acceleration z", m.acceleration[2], Some(1.036));
        assert_close("battery", m.battery_voltage, None);
        assert_close("tx power", m.tx_power, Some(4.0));
        assert_close("temperature", m.temperature, Some(24.3));
    }

    #[test]
    fn test_v1_valid() {
        let m = decode(&hex("03291A1ECE1EFC18F94202CA0B53")).unwrap();
        assert_eq!(m.format, DataFormat::V1);
        assert_close("temperature", m.temperature, Some(26.3));
        assert_close("humidity", m.humidity, Some(20.5));
        assert_close("pressure", m.pressure, Some(1027.66));
        assert_close("acceleration x", m.acceleration[0], Some(-1.0));
        assert_close("acceleration y", m.acceleration[1], Some(-1.726));
        assert_close("acceleration z", m.acceleration[2], Some(0.714));
        assert_close("battery", m.battery_voltage, Some(2.899));
        assert_eq!(m.tx_power, None);
        assert_eq!(m.movement_counter, None);
        assert_eq!(m.sequence_number, None);
        assert_eq!(m.mac, None);
    }

    #[test]
    fn test_v1_maximum() {
        let m = decode(&hex("03FF7F63FFFF7FFF7FFF7FFFFFFF")).unwrap();
        assert_close("temperature", m.temperature, Some(127.99));
        assert_close("humidity", m.humidity, Some(127.5));
        assert_close("pressure", m.pressure, Some(1155.35));
        assert_close("battery", m.battery_voltage, Some(65.535));
    }

    #[test]
    fn test_v1_minimum() {
        let m = decode(&hex("0300FF6300008001800180010000")).unwrap();
        assert_close("temperature", m.temperature, Some(-127.99));
        assert_close("humidity", m.humidity, Some(0.0));
        assert_close("pressure", m.pressure, Some(500.0));
        for axis in m.acceleration {
            assert_close("acceleration", axis, Some(-32.767));
        }
        assert_close("battery", m.battery_voltage, Some(0.0));
    }

    #[test]
    fn test_v1_fraction_out_of_range_drops_only_temperature() {
        let m = decode(&hex("03291A64CE1EFC18F94202CA0B53")).unwrap();
        assert_eq!(m.temperature, None);
        assert_close("humidity", m.humidity, Some(20.5));
        assert_close("pressure", m.pressure, Some(1027.66));
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_unsupported_format() {
        assert_eq!(
            decode(&hex("537FFF")),
            Err(DecodeError::UnsupportedFormat(0x53))
        );
    }

    #[test]
    fn test_only_formats_3_and_5_accepted() {
        for format in (0..=u8::MAX).filter(|f| *f != 3 && *f != 5) {
            let mut data = vec![0u8; V2_LENGTH];
            data[0] = format;
            assert_eq!(decode(&data), Err(DecodeError::UnsupportedFormat(format)));
        }
    }

    #[test]
    fn test_wrong_length_names_expected_size() {
        let err = decode(&hex("03291A1ECE1EFC18F94202CA0B")).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidLength {
                format: 3,
                expected: 14,
                actual: 13
            }
        );
        assert!(err.to_string().contains("exactly 14 bytes"));

        let err = decode(&hex("0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F00")).unwrap_err();
        assert!(err.to_string().contains("exactly 24 bytes"));
    }

    #[test]
    fn test_decoding_is_deterministic() {
        for payload in [
            "0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F",
            "058000FFFFFFFF800080008000FFFFFFFFFFFFFFFFFFFFFF",
            "03291A1ECE1EFC18F94202CA0B53",
        ] {
            let data = hex(payload);
            assert_eq!(decode(&data), decode(&data));
        }
    }
}
