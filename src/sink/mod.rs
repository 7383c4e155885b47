//! Measurement sinks.
//!
//! A [`Sink`] pairs a concrete publisher with its own [`RateLimiter`]. The
//! concrete publisher is chosen once, from the configuration, by
//! [`build_sink`].

pub mod mqtt;
pub mod stdout;

use crate::config::SinkConfig;
use crate::measurement::PublishableMeasurement;
use crate::rate_limiter::{BatchPublisher, RateLimiter};
use std::io;
use std::sync::Arc;
use thiserror::Error;

pub use mqtt::MqttSink;
pub use stdout::StdoutSink;

/// Errors delivering a batch downstream.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink {sink}: failed to write measurements: {source}")]
    Write { sink: String, source: io::Error },
    #[error("sink {sink}: failed to encode measurement: {source}")]
    Encode {
        sink: String,
        source: serde_json::Error,
    },
    #[error("sink {sink}: failed to queue MQTT message: {source}")]
    Mqtt {
        sink: String,
        source: rumqttc::ClientError,
    },
}

/// A named, rate limited destination for measurements.
pub struct Sink {
    name: String,
    limiter: RateLimiter,
}

impl Sink {
    pub fn new(name: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            name: name.into(),
            limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a measurement for publication. Failures are logged by the limiter.
    pub async fn publish(&self, measurement: PublishableMeasurement) {
        self.limiter.publish(measurement).await;
    }

    /// Flush anything still pending and stop.
    pub async fn close(self) {
        self.limiter.close().await;
    }
}

/// Build the sink described by `config`.
///
/// Spawns the rate limiter task when the sink is rate limited, so this has to
/// be called from within a tokio runtime.
pub fn build_sink(config: &SinkConfig) -> Sink {
    let publisher: Arc<dyn BatchPublisher> = match config {
        SinkConfig::Mqtt(mqtt) => Arc::new(MqttSink::connect(mqtt)),
        SinkConfig::Stdout(stdout) => Arc::new(StdoutSink::new(
            stdout.name.clone(),
            stdout.format,
            stdout.measurement.clone(),
        )),
    };
    Sink::new(config.name(), RateLimiter::new(config.rate_limit(), publisher))
}
