//! MQTT sink.
//!
//! Each batch becomes one JSON message on the configured topic:
//!
//! ```json
//! {"measurements":[{"sensorMac":"AA:BB:CC:DD:EE:FF","temperature":24.3,"humidity":53.49,"pressure":1000.44,"batteryVoltage":2.977}]}
//! ```
//!
//! Absent values are left out. Messages are sent with QoS 0; a batch that
//! can't be queued for the broker is dropped.

use super::SinkError;
use crate::backoff::Backoff;
use crate::config::{MqttSinkConfig, MqttTls};
use crate::measurement::PublishableMeasurement;
use crate::rate_limiter::{BatchPublisher, PublishFuture};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Messages waiting for the connection task. Publishing fails once it's full.
const REQUEST_CAPACITY: usize = 10;

/// Prefix of the client id picked when none is configured.
const CLIENT_ID_PREFIX: &str = "ruuvirelay";

/// Delay between connection attempts.
const RECONNECT_BACKOFF: Backoff = Backoff {
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(5 * 60),
    factor: 2.0,
};

#[derive(Serialize)]
struct Publication<'a> {
    measurements: Vec<WireMeasurement<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMeasurement<'a> {
    sensor_mac: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_voltage: Option<f64>,
}

fn present(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

/// JSON payload for one batch, sorted by sensor.
fn encode_batch(batch: &[PublishableMeasurement]) -> Result<Vec<u8>, serde_json::Error> {
    let ids: Vec<String> = batch.iter().map(PublishableMeasurement::sensor_id).collect();
    let mut measurements: Vec<WireMeasurement> = batch
        .iter()
        .zip(&ids)
        .map(|(m, id)| WireMeasurement {
            sensor_mac: id,
            temperature: present(m.temperature),
            humidity: present(m.humidity),
            pressure: present(m.pressure),
            battery_voltage: present(m.battery_voltage),
        })
        .collect();
    measurements.sort_by(|a, b| a.sensor_mac.cmp(b.sensor_mac));
    serde_json::to_vec(&Publication { measurements })
}

/// Sink publishing batches to an MQTT broker.
pub struct MqttSink {
    name: String,
    topic: String,
    client: AsyncClient,
    connection: JoinHandle<()>,
}

impl MqttSink {
    /// Create the client and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &MqttSinkConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let connection = tokio::spawn(drive_connection(config.name.clone(), eventloop));
        Self::with_client(config, client, connection)
    }

    fn with_client(config: &MqttSinkConfig, client: AsyncClient, connection: JoinHandle<()>) -> Self {
        Self {
            name: config.name.clone(),
            topic: config.topic.clone(),
            client,
            connection,
        }
    }

    fn publish(&self, batch: &[PublishableMeasurement]) -> Result<(), SinkError> {
        let payload = encode_batch(batch).map_err(|source| SinkError::Encode {
            sink: self.name.clone(),
            source,
        })?;
        self.client
            .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
            .map_err(|source| SinkError::Mqtt {
                sink: self.name.clone(),
                source,
            })
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        // Let the connection task send what is queued, then stop.
        if self.client.try_disconnect().is_err() {
            self.connection.abort();
        }
    }
}

impl BatchPublisher for MqttSink {
    fn publish_batch(&self, batch: Vec<PublishableMeasurement>) -> PublishFuture<'_> {
        Box::pin(async move { self.publish(&batch) })
    }
}

fn mqtt_options(config: &MqttSinkConfig) -> MqttOptions {
    let client_id = if config.client_id.is_empty() {
        random_client_id()
    } else {
        config.client_id.clone()
    };

    let mut options = MqttOptions::new(client_id, config.server_name.clone(), config.server_port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if !config.username.is_empty() || !config.password.is_empty() {
        options.set_credentials(config.username.clone(), config.password.clone());
    }
    if let Some(tls) = &config.tls {
        options.set_transport(transport(tls));
    }
    options
}

fn transport(tls: &MqttTls) -> Transport {
    match &tls.ca_certs {
        Some(ca) => Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.clone(),
            alpn: None,
            client_auth: None,
        }),
        None => Transport::tls_with_default_config(),
    }
}

fn random_client_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{CLIENT_ID_PREFIX}{suffix}")
}

/// Poll the event loop, which (re)connects as needed, until a disconnect is
/// sent.
async fn drive_connection(sink: String, mut eventloop: EventLoop) {
    let mut failures = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(sink, "connected to MQTT broker");
                failures = 0;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(sink, "disconnected from MQTT broker");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                let delay = RECONNECT_BACKOFF.delay(failures);
                warn!(sink, error = %e, ?delay, "MQTT connection failed, reconnecting");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, measurement};

    fn config() -> MqttSinkConfig {
        MqttSinkConfig {
            name: "broker".to_string(),
            topic: "/measurements".to_string(),
            client_id: "pusher".to_string(),
            username: "bob".to_string(),
            password: "ilovealice".to_string(),
            server_name: "127.0.0.1".to_string(),
            server_port: 1883,
            tls: None,
            rate_limit: None,
        }
    }

    #[test]
    fn test_encode_batch() {
        let mut partial = measurement("11:22:33:44:55:66".parse().unwrap(), 10.0);
        partial.humidity = 60.0;
        partial.pressure = f64::NAN;
        partial.battery_voltage = f64::NAN;
        let mut full = measurement(TEST_MAC, 24.3);
        full.humidity = 53.49;
        full.pressure = 1000.44;
        full.battery_voltage = 2.977;

        let payload = encode_batch(&[full, partial]).unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "{\"measurements\":[\
             {\"sensorMac\":\"11:22:33:44:55:66\",\"temperature\":10.0,\"humidity\":60.0},\
             {\"sensorMac\":\"AA:BB:CC:DD:EE:FF\",\"temperature\":24.3,\"humidity\":53.49,\
             \"pressure\":1000.44,\"batteryVoltage\":2.977}]}"
        );
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(id.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(id.len(), CLIENT_ID_PREFIX.len() + 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_mqtt_options() {
        let options = mqtt_options(&config());
        assert_eq!(options.client_id(), "pusher");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("bob".to_string(), "ilovealice".to_string()))
        );

        let mut anonymous = config();
        anonymous.client_id.clear();
        anonymous.username.clear();
        anonymous.password.clear();
        let options = mqtt_options(&anonymous);
        assert!(options.client_id().starts_with(CLIENT_ID_PREFIX));
        assert_eq!(options.credentials(), None);
    }

    #[tokio::test]
    async fn test_full_request_queue_drops_batch() {
        // Nothing drives the event loop, so requests pile up.
        let (client, _eventloop) = AsyncClient::new(mqtt_options(&config()), 1);
        let sink = MqttSink::with_client(&config(), client, tokio::spawn(async {}));

        sink.publish_batch(vec![measurement(TEST_MAC, 1.0)])
            .await
            .unwrap();
        let err = sink
            .publish_batch(vec![measurement(TEST_MAC, 2.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Mqtt { .. }));
        assert!(err.to_string().contains("broker"));
    }
}
