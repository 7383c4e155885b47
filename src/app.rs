//! Core application runner for `ruuvitag-relay`.
//!
//! Decoupled from CLI parsing, the Bluetooth stack and process exit codes so
//! the whole pipeline can be driven by a fake transport in tests.

use crate::advertisement::{RUUVI_MANUFACTURER_ID, RawAdvertisement};
use crate::config::{Config, ConfigError};
use crate::decoder::decode;
use crate::measurement::PublishableMeasurement;
use crate::sink::{Sink, build_sink};
use crate::tracker::{
    AdvertisementStream, Transport, TrackerError, TrackerOptions, TransportError, TransportEvent,
    spawn_tracker,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Command line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Path to the TOML configuration file.
    /// Without one, measurements are printed to stdout.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Prefix log lines with a timestamp. Turn off when journald adds its own.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub log_time: bool,

    /// Verbose output, log debug messages
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("Bluetooth backend not available: {0}")]
    BackendNotAvailable(&'static str),
}

/// Track advertisements from `transport` and relay them to the configured sinks.
///
/// Runs until the tracker stops, which only happens on a fatal error. Pending
/// rate limit windows are flushed before returning.
pub async fn run(
    config: &Config,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    options: TrackerOptions,
) -> Result<(), RunError> {
    let sinks: Vec<Sink> = config.sinks.iter().map(build_sink).collect();
    let names: Vec<&str> = sinks.iter().map(Sink::name).collect();
    info!(adapter = %config.adapter, sinks = ?names, "relaying RuuviTag measurements");

    let stream = spawn_tracker(transport, events, options);
    let result = relay(stream, &sinks).await;

    for sink in sinks {
        sink.close().await;
    }
    result
}

/// Decode every advertisement from `stream` and publish it to all `sinks`.
///
/// Returns the tracker's terminal error once the stream ends.
pub async fn relay(mut stream: AdvertisementStream, sinks: &[Sink]) -> Result<(), RunError> {
    while let Some(adv) = stream.recv().await {
        if let Some(measurement) = to_measurement(&adv, SystemTime::now()) {
            for sink in sinks {
                sink.publish(measurement.clone()).await;
            }
        }
    }
    stream.finish().await?;
    Ok(())
}

/// Turn an advertisement into a measurement, if it carries a decodable Ruuvi payload.
fn to_measurement(adv: &RawAdvertisement, received: SystemTime) -> Option<PublishableMeasurement> {
    let Some(payload) = adv.manufacturer_data.get(&RUUVI_MANUFACTURER_ID) else {
        debug!(sensor = %adv.address, "skipping advertisement without Ruuvi data");
        return None;
    };
    match decode(payload) {
        Ok(decoded) => Some(PublishableMeasurement::new(adv.address, received, &decoded)),
        Err(e) => {
            warn!(sensor = %adv.address, error = %e, "failed to decode advertisement");
            None
        }
    }
}
