//! `ruuvitag-relay` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! The pipeline lives in [`crate::app`]: a [`tracker`] turns device events
//! from a Bluetooth transport into advertisements, the [`decoder`] turns Ruuvi
//! payloads into measurements, and every [`sink`] publishes them through its
//! own [`rate_limiter`].

pub mod advertisement;
pub mod app;
pub mod backoff;
pub mod config;
pub mod decoder;
pub mod logging;
pub mod mac_address;
pub mod measurement;
pub mod rate_limiter;
pub mod sink;
pub mod tracker;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{DeviceKey, DeviceProperty, ManufacturerData, RawAdvertisement};
pub use config::{
    Config, MqttSinkConfig, OutputFormat, SinkConfig, StdoutSinkConfig, parse_duration,
};
pub use decoder::{DecodeError, decode};
pub use mac_address::MacAddress;
pub use measurement::{DataFormat, DecodedMeasurement, PublishableMeasurement};
pub use rate_limiter::{BatchPublisher, RateLimiter};
pub use sink::{MqttSink, Sink, SinkError, StdoutSink, build_sink};
pub use tracker::{
    AdvertisementStream, TrackerError, TrackerOptions, Transport, TransportError, TransportEvent,
    spawn_tracker,
};
