//! Standard output sink.
//!
//! Writes each batch sorted by sensor, one line per measurement, in one of
//! three formats:
//!
//! - `text`: `[console] AA:BB:CC:DD:EE:FF = 24.30°C, 53.49%, 1000.44hPa, 2.98V`
//! - `influxdb`: InfluxDB line protocol, absent values omitted
//! - `json`: one object per line, absent values as `null`

use super::SinkError;
use crate::config::OutputFormat;
use crate::measurement::PublishableMeasurement;
use crate::rate_limiter::{BatchPublisher, PublishFuture};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, f64>,
    pub timestamp: Option<SystemTime>,
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{key}={}", escape_tag(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (i, (key, value)) in data_point.field_set.iter().enumerate() {
        if i > 0 {
            write!(fmt, ",")?;
        }
        write!(fmt, "{key}={value}")?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    // Timestamps before the epoch are left out; InfluxDB then uses its own clock.
    if let Some(since_epoch) = data_point
        .timestamp
        .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
    {
        write!(fmt, " {}", since_epoch.as_nanos())?;
    }
    Ok(())
}

/// Escape characters with a meaning in line protocol tag values.
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.measurement)?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// Sink printing measurements to standard output, or any other writer.
pub struct StdoutSink {
    name: String,
    format: OutputFormat,
    measurement: String,
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StdoutSink {
    pub fn new(name: String, format: OutputFormat, measurement: String) -> Self {
        Self::with_writer(name, format, measurement, Box::new(io::stdout()))
    }

    /// Like [`StdoutSink::new`], writing to `out` instead of standard output.
    pub fn with_writer(
        name: String,
        format: OutputFormat,
        measurement: String,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            name,
            format,
            measurement,
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// One output line, or `None` when there is nothing to write.
    fn render(&self, m: &PublishableMeasurement) -> Result<Option<String>, SinkError> {
        match self.format {
            OutputFormat::Text => Ok(Some(format!(
                "[{}] {} = {:.2}°C, {:.2}%, {:.2}hPa, {:.2}V",
                self.name, m.sensor_mac, m.temperature, m.humidity, m.pressure, m.battery_voltage
            ))),
            OutputFormat::InfluxDb => {
                let point = self.to_data_point(m);
                // A point without fields is invalid line protocol.
                Ok((!point.field_set.is_empty()).then(|| point.to_string()))
            }
            OutputFormat::Json => serde_json::to_string(m)
                .map(Some)
                .map_err(|source| SinkError::Encode {
                    sink: self.name.clone(),
                    source,
                }),
        }
    }

    fn to_data_point(&self, m: &PublishableMeasurement) -> DataPoint {
        let mut tag_set = BTreeMap::new();
        tag_set.insert("sensor_mac".to_string(), m.sensor_id());
        tag_set.insert("sink".to_string(), self.name.clone());

        let mut field_set = BTreeMap::new();
        for (name, value) in [
            ("temperature", m.temperature),
            ("humidity", m.humidity),
            ("pressure", m.pressure),
            ("battery_voltage", m.battery_voltage),
        ] {
            if !value.is_nan() {
                field_set.insert(name.to_string(), value);
            }
        }

        DataPoint {
            measurement: self.measurement.clone(),
            tag_set,
            field_set,
            timestamp: Some(m.timestamp),
        }
    }

    fn render_batch(&self, mut batch: Vec<PublishableMeasurement>) -> Result<String, SinkError> {
        batch.sort_by_key(|m| m.sensor_mac);

        let mut lines = String::new();
        for m in &batch {
            if let Some(line) = self.render(m)? {
                lines.push_str(&line);
                lines.push('\n');
            }
        }
        Ok(lines)
    }

    async fn write_batch(&self, batch: Vec<PublishableMeasurement>) -> Result<(), SinkError> {
        let lines = self.render_batch(batch)?;
        if lines.is_empty() {
            return Ok(());
        }

        // A stalled stdout pipe must not hold up the runtime's worker threads.
        let out = Arc::clone(&self.out);
        let written = tokio::task::spawn_blocking(move || {
            let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
            out.write_all(lines.as_bytes()).and_then(|()| out.flush())
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));

        written.map_err(|source| SinkError::Write {
            sink: self.name.clone(),
            source,
        })
    }
}

impl BatchPublisher for StdoutSink {
    fn publish_batch(&self, batch: Vec<PublishableMeasurement>) -> PublishFuture<'_> {
        Box::pin(self.write_batch(batch))
    }
}
