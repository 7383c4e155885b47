use crate::advertisement::{DeviceKey, DeviceProperty};
use crate::mac_address::MacAddress;
use crate::measurement::PublishableMeasurement;
use crate::rate_limiter::{BatchPublisher, PublishFuture};
use crate::sink::SinkError;
use crate::tracker::{Transport, TransportError, TransportFuture};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Decode a hex string such as `"0512FC"` into bytes.
pub fn hex(s: &str) -> Vec<u8> {
    assert!(s.len() % 2 == 0, "odd-length hex string: {s}");
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// A measurement with only the temperature set.
pub fn measurement(mac: MacAddress, temperature: f64) -> PublishableMeasurement {
    PublishableMeasurement {
        sensor_mac: mac,
        timestamp: SystemTime::UNIX_EPOCH,
        temperature,
        humidity: f64::NAN,
        pressure: f64::NAN,
        battery_voltage: f64::NAN,
    }
}

/// In-memory transport with scripted command results.
///
/// Queued results are consumed in order; once a queue is empty,
/// `start_discovery` succeeds and `is_discovering` reports `true`.
#[derive(Debug, Default)]
pub struct FakeTransport {
    properties: Mutex<HashMap<DeviceKey, Vec<DeviceProperty>>>,
    start_results: Mutex<VecDeque<Result<(), TransportError>>>,
    discovering: Mutex<VecDeque<Result<bool, TransportError>>>,
    fetches: AtomicUsize,
    starts: AtomicUsize,
    discovering_checks: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_properties(&self, key: &str, props: Vec<DeviceProperty>) {
        self.properties.lock().unwrap().insert(key.into(), props);
    }

    pub fn push_start_result(&self, result: Result<(), TransportError>) {
        self.start_results.lock().unwrap().push_back(result);
    }

    pub fn push_discovering(&self, result: Result<bool, TransportError>) {
        self.discovering.lock().unwrap().push_back(result);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn discovering_count(&self) -> usize {
        self.discovering_checks.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn fetch_all_properties<'a>(
        &'a self,
        key: &'a DeviceKey,
    ) -> TransportFuture<'a, Vec<DeviceProperty>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = self
            .properties
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| TransportError::Bluetooth(format!("no such device: {key}")));
        Box::pin(async move { result })
    }

    fn start_discovery(&self) -> TransportFuture<'_, ()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let result = self
            .start_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        Box::pin(async move { result })
    }

    fn is_discovering(&self) -> TransportFuture<'_, bool> {
        self.discovering_checks.fetch_add(1, Ordering::SeqCst);
        let result = self
            .discovering
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(true));
        Box::pin(async move { result })
    }
}

/// Publisher remembering every batch it was handed.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<Vec<PublishableMeasurement>>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl RecordingPublisher {
    /// A publisher whose first `failures` calls fail.
    pub fn failing(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    /// Successfully published batches, in order.
    pub fn batches(&self) -> Vec<Vec<PublishableMeasurement>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BatchPublisher for RecordingPublisher {
    fn publish_batch(&self, batch: Vec<PublishableMeasurement>) -> PublishFuture<'_> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SinkError::Write {
                    sink: "recording".to_string(),
                    source: io::Error::other("scripted failure"),
                });
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        })
    }
}

/// Cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
