//! Configuration file handling.
//!
//! The file is TOML:
//!
//! ```toml
//! adapter = "hci0"
//!
//! [[sinks.mqtt]]
//! name = "broker"
//! topic = "/measurements"
//! client_id = "relay"
//! username = "bob"
//! password = "secret"
//! server_name = "mqtt.example.com"
//! server_port = 8883
//! enable_tls = true
//! [sinks.mqtt.tls]
//! ca_certs = "ca.pem"
//!
//! [[sinks.stdout]]
//! name = "console"
//! format = "influxdb"
//! measurement = "ruuvi_measurement"
//! [sinks.stdout.rate_limit]
//! max_1_in = "1m10s"
//! ```
//!
//! Apart from the MQTT topic and server, every key is optional. Without any
//! sink, a single stdout sink named `default-sink` is used. Relative paths are
//! resolved against the directory of the configuration file.

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Adapter used when the file doesn't name one.
pub const DEFAULT_ADAPTER: &str = "hci0";

/// InfluxDB measurement name used when a sink doesn't set one.
pub const DEFAULT_MEASUREMENT: &str = "ruuvi_measurement";

/// Name of the sink created when none are configured.
pub const DEFAULT_SINK_NAME: &str = "default-sink";

/// Shortest accepted rate limit window.
pub const MIN_RATE_LIMIT: Duration = crate::rate_limiter::MIN_WINDOW;

/// MQTT broker port used when a sink doesn't set one.
pub const DEFAULT_MQTT_PORT: u16 = 8883;

/// Longest client id every MQTT 3.1.1 broker has to accept.
const MAX_CLIENT_ID_LEN: usize = 23;

/// Longest UTF-8 string MQTT can carry.
const MAX_MQTT_STRING_LEN: usize = 65535;

/// Errors loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("sink {sink}: failed to parse rate limit: {reason}")]
    RateLimit { sink: String, reason: String },
    #[error("sink {sink}: {reason}")]
    Sink { sink: String, reason: String },
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Bluetooth adapter to listen on, e.g. `hci0`.
    pub adapter: String,
    /// MQTT sinks first, then stdout sinks, each in the order they were
    /// declared. Never empty.
    pub sinks: Vec<SinkConfig>,
}

/// Configuration of one sink, by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkConfig {
    Mqtt(MqttSinkConfig),
    Stdout(StdoutSinkConfig),
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::Mqtt(mqtt) => &mqtt.name,
            SinkConfig::Stdout(stdout) => &stdout.name,
        }
    }

    pub fn rate_limit(&self) -> Option<Duration> {
        match self {
            SinkConfig::Mqtt(mqtt) => mqtt.rate_limit,
            SinkConfig::Stdout(stdout) => stdout.rate_limit,
        }
    }
}

/// Publish JSON batches to an MQTT 3.1.1 broker.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSinkConfig {
    pub name: String,
    pub topic: String,
    /// Empty means a random id is picked when connecting.
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub server_name: String,
    pub server_port: u16,
    /// `None` for a plain TCP connection.
    pub tls: Option<MqttTls>,
    pub rate_limit: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MqttTls {
    /// PEM encoded root certificates. The system roots are used without them.
    pub ca_certs: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StdoutSinkConfig {
    pub name: String,
    pub format: OutputFormat,
    /// Measurement name for the InfluxDB line protocol format.
    pub measurement: String,
    /// Publish at most one batch per this window.
    pub rate_limit: Option<Duration>,
}

impl StdoutSinkConfig {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: OutputFormat::default(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
            rate_limit: None,
        }
    }
}

/// How the stdout sink renders measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum OutputFormat {
    /// Human readable, one line per measurement.
    #[default]
    #[serde(rename = "text")]
    Text,
    /// InfluxDB line protocol.
    #[serde(rename = "influxdb")]
    InfluxDb,
    /// One JSON object per line.
    #[serde(rename = "json")]
    Json,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    adapter: Option<String>,
    #[serde(default)]
    sinks: FileSinks,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSinks {
    #[serde(default)]
    mqtt: Vec<FileMqttSink>,
    #[serde(default)]
    stdout: Vec<FileStdoutSink>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMqttSink {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    format: Option<String>,
    #[serde(default)]
    server_name: String,
    server_port: Option<u16>,
    enable_tls: Option<bool>,
    #[serde(default)]
    tls: FileTls,
    rate_limit: Option<FileRateLimit>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    ca_certs: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStdoutSink {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    format: OutputFormat,
    measurement: Option<String>,
    rate_limit: Option<FileRateLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRateLimit {
    max_1_in: String,
}

impl Config {
    /// Load the configuration from `path`, or the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Self::from_toml_str("");
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&content, base)
    }

    /// Parse and validate a configuration document. Relative paths in it are
    /// resolved against the working directory.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new(""))
    }

    fn parse(content: &str, base: &Path) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(content)?;

        let mut sinks = Vec::with_capacity(file.sinks.mqtt.len() + file.sinks.stdout.len());
        for (index, sink) in file.sinks.mqtt.into_iter().enumerate() {
            sinks.push(SinkConfig::Mqtt(mqtt_sink(index, sink, base)?));
        }
        for (index, sink) in file.sinks.stdout.into_iter().enumerate() {
            sinks.push(SinkConfig::Stdout(stdout_sink(index, sink)?));
        }
        if sinks.is_empty() {
            sinks.push(SinkConfig::Stdout(StdoutSinkConfig::named(DEFAULT_SINK_NAME)));
        }

        Ok(Config {
            adapter: file.adapter.unwrap_or_else(|| DEFAULT_ADAPTER.to_string()),
            sinks,
        })
    }
}

fn sink_name(kind: &str, index: usize, name: Option<String>) -> String {
    match name {
        Some(name) if !name.is_empty() => name,
        _ => format!("unnamed-{kind}-sink-{index}"),
    }
}

fn mqtt_sink(index: usize, sink: FileMqttSink, base: &Path) -> Result<MqttSinkConfig, ConfigError> {
    let name = sink_name("mqtt", index, sink.name);
    let invalid = |reason: String| ConfigError::Sink {
        sink: name.clone(),
        reason,
    };

    let topic = sink.topic;
    if topic.is_empty()
        || topic.len() > MAX_MQTT_STRING_LEN
        || topic.starts_with('$')
        || topic.contains(['+', '#', '\0'])
    {
        return Err(invalid(format!("topic is not a valid MQTT topic name, given: '{topic}'")));
    }
    if sink.client_id.len() > MAX_CLIENT_ID_LEN
        || !sink.client_id.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(invalid(format!(
            "client_id must be at most {MAX_CLIENT_ID_LEN} letters and digits, given: '{}'",
            sink.client_id
        )));
    }
    if sink.username.len() > MAX_MQTT_STRING_LEN || sink.password.len() > MAX_MQTT_STRING_LEN {
        return Err(invalid(format!(
            "username and password are limited to {MAX_MQTT_STRING_LEN} bytes"
        )));
    }
    match sink.format.as_deref() {
        None | Some("JSON") => {}
        Some("BINARY") => {
            return Err(invalid(
                "the BINARY publication format is not supported, use JSON".to_string(),
            ));
        }
        Some(other) => {
            return Err(invalid(format!("format must be JSON, given: '{other}'")));
        }
    }
    if sink.server_name.is_empty() {
        return Err(invalid("server_name is a required field".to_string()));
    }

    let tls = if sink.enable_tls.unwrap_or(true) {
        let ca_certs = sink
            .tls
            .ca_certs
            .map(|path| {
                let path = base.join(path);
                std::fs::read(&path).map_err(|source| ConfigError::Read { path, source })
            })
            .transpose()?;
        Some(MqttTls { ca_certs })
    } else {
        None
    };

    let rate_limit = sink
        .rate_limit
        .map(|limit| rate_limit(&name, &limit.max_1_in))
        .transpose()?;

    Ok(MqttSinkConfig {
        name,
        topic,
        client_id: sink.client_id,
        username: sink.username,
        password: sink.password,
        server_name: sink.server_name,
        server_port: sink.server_port.unwrap_or(DEFAULT_MQTT_PORT),
        tls,
        rate_limit,
    })
}

fn stdout_sink(index: usize, sink: FileStdoutSink) -> Result<StdoutSinkConfig, ConfigError> {
    let name = sink_name("stdout", index, sink.name);
    let rate_limit = sink
        .rate_limit
        .map(|limit| rate_limit(&name, &limit.max_1_in))
        .transpose()?;

    Ok(StdoutSinkConfig {
        name,
        format: sink.format,
        measurement: sink
            .measurement
            .unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string()),
        rate_limit,
    })
}

fn rate_limit(sink: &str, max_1_in: &str) -> Result<Duration, ConfigError> {
    let window = parse_duration(max_1_in).map_err(|reason| ConfigError::RateLimit {
        sink: sink.to_string(),
        reason,
    })?;
    if window < MIN_RATE_LIMIT {
        return Err(ConfigError::RateLimit {
            sink: sink.to_string(),
            reason: format!("max_1_in must be at least 1s, given: '{max_1_in}'"),
        });
    }
    Ok(window)
}

/// Parse a duration such as `500ms`, `1m10s`, `1.5h` or `2h45m30.5s`.
///
/// The string is a sequence of decimal numbers, each followed by one of the
/// units `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare integer is
/// interpreted as seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    // `ms` has to be tried before `m`.
    const UNITS: [(&str, u128); 7] = [
        ("ns", 1),
        ("us", 1_000),
        ("µs", 1_000),
        ("ms", 1_000_000),
        ("s", NANOS_PER_SEC),
        ("m", 60 * NANOS_PER_SEC),
        ("h", 3_600 * NANOS_PER_SEC),
    ];
    // Enough for nanosecond precision of hours.
    const MAX_FRACTION_DIGITS: usize = 18;

    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Ok(secs) = src.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || format!("invalid duration: {src}");
    let out_of_range = || format!("duration out of range: {src}");

    let mut nanos: u128 = 0;
    let mut rest = src;
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(end);
        let tail = tail.trim_start();
        let &(unit, scale) = UNITS
            .iter()
            .find(|(unit, _)| tail.starts_with(unit))
            .ok_or_else(invalid)?;

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| out_of_range())?
        };
        let fraction = &fraction[..fraction.len().min(MAX_FRACTION_DIGITS)];
        let fraction_nanos = if fraction.is_empty() {
            0
        } else {
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            digits * scale / 10u128.pow(fraction.len() as u32)
        };

        let component = whole
            .checked_mul(scale)
            .and_then(|n| n.checked_add(fraction_nanos))
            .ok_or_else(out_of_range)?;
        nanos = nanos.checked_add(component).ok_or_else(out_of_range)?;
        rest = tail[unit.len()..].trim_start();
    }

    let secs = u64::try_from(nanos / NANOS_PER_SEC).map_err(|_| out_of_range())?;
    Ok(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
}
