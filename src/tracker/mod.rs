//! Advertisement tracker.
//!
//! Keeps a per-device cache of the last seen advertisement, fed by device
//! events from a [`Transport`], and republishes an advertisement whenever its
//! manufacturer data changes or the device shows signs of life. A separate
//! supervisor task keeps the adapter in discovery mode.
//!
//! Two tasks cooperate through channels only:
//!
//! - the event processor is the single owner of the device cache and the only
//!   sender on the output channel;
//! - the discovery supervisor starts discovery, polls that it is still running
//!   and asks the event processor to drop the cache or to shut down.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::advertisement::{AdvertisementError, DeviceKey, DeviceProperty, RawAdvertisement};
use crate::backoff::Backoff;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// D-Bus interface describing a remote device.
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// Buffer size transports should use for their event channel.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 10;

const CONTROL_CHANNEL_BUFFER_SIZE: usize = 4;

/// Device events delivered by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PropertiesChanged {
        key: DeviceKey,
        interface: String,
        changed: Vec<DeviceProperty>,
        invalidated: Vec<String>,
    },
    InterfacesAdded {
        key: DeviceKey,
        interfaces: HashMap<String, Vec<DeviceProperty>>,
    },
    InterfacesRemoved {
        key: DeviceKey,
        interfaces: Vec<String>,
    },
}

/// Errors reported by a transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The adapter is still powering on. Worth retrying.
    #[error("Resource Not Ready: {0}")]
    NotReady(String),
    #[error("requested to listen on Bluetooth adapter '{0}', but it doesn't exist")]
    AdapterNotFound(String),
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::NotReady(_))
    }
}

/// Boxed future returned by [`Transport`] operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Commands the tracker issues against the Bluetooth stack.
///
/// Events flow separately, through the `mpsc::Receiver<TransportEvent>` handed
/// to [`spawn_tracker`]. Closing that channel signals connection loss.
pub trait Transport: Send + Sync {
    /// Read every property of the device interface of `key`.
    fn fetch_all_properties<'a>(
        &'a self,
        key: &'a DeviceKey,
    ) -> TransportFuture<'a, Vec<DeviceProperty>>;

    fn start_discovery(&self) -> TransportFuture<'_, ()>;

    fn is_discovering(&self) -> TransportFuture<'_, bool>;
}

/// Fatal tracker errors. At most one is reported per tracker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("failed to start discovery: {0}")]
    StartDiscovery(TransportError),
    #[error("failed to read discovering status: {0}")]
    DiscoveringStatus(TransportError),
    #[error("transport event stream closed")]
    TransportClosed,
    #[error("discovery supervisor stopped unexpectedly")]
    SupervisorStopped,
}

/// Per-event failures. Logged, never fatal.
#[derive(Error, Debug)]
enum EventError {
    #[error("failed to get all properties of {key}: {source}")]
    Fetch {
        key: DeviceKey,
        source: TransportError,
    },
    #[error("failed to parse properties of {key} into an advertisement: {source}")]
    Parse {
        key: DeviceKey,
        source: AdvertisementError,
    },
}

/// Tuning knobs of the tracker.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// How often to check that the adapter is still discovering.
    pub poll_interval: Duration,
    /// Delay between attempts to start discovery while the adapter is not ready.
    pub start_backoff: Backoff,
    /// Retries after the first failed start attempt.
    pub start_retries: u32,
    /// Capacity of the output channel; a full channel blocks the tracker.
    pub output_capacity: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(4 * 60),
            start_backoff: Backoff::default(),
            start_retries: 5,
            output_capacity: 10,
        }
    }
}

/// Receiving end of a tracker.
///
/// Yields advertisements until the tracker stops; [`AdvertisementStream::finish`]
/// then tells whether it stopped because of an error.
#[derive(Debug)]
pub struct AdvertisementStream {
    advertisements: mpsc::Receiver<RawAdvertisement>,
    error: oneshot::Receiver<TrackerError>,
}

impl AdvertisementStream {
    /// Next advertisement, or `None` once the tracker has stopped.
    pub async fn recv(&mut self) -> Option<RawAdvertisement> {
        self.advertisements.recv().await
    }

    /// Stop receiving and return the terminal error, if any.
    pub async fn finish(self) -> Result<(), TrackerError> {
        let AdvertisementStream {
            advertisements,
            error,
        } = self;
        drop(advertisements);
        match error.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

/// Start tracking advertisements reported by `transport`.
///
/// Spawns the event processor and the discovery supervisor on the current
/// tokio runtime.
pub fn spawn_tracker(
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    options: TrackerOptions,
) -> AdvertisementStream {
    let (output, advertisements) = mpsc::channel(options.output_capacity.max(1));
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_BUFFER_SIZE);
    let (error_tx, error_rx) = oneshot::channel();

    let supervisor = DiscoverySupervisor {
        transport: Arc::clone(&transport),
        control: control_tx,
        options,
    };
    let supervisor = tokio::spawn(supervisor.run());

    let processor = EventProcessor {
        transport,
        cache: HashMap::new(),
        output,
    };
    tokio::spawn(processor.run(events, control_rx, supervisor, error_tx));

    AdvertisementStream {
        advertisements,
        error: error_rx,
    }
}

/// Messages from the discovery supervisor to the event processor.
#[derive(Debug)]
enum Control {
    ClearCache,
    Fail(TrackerError),
}

struct EventProcessor {
    transport: Arc<dyn Transport>,
    cache: HashMap<DeviceKey, RawAdvertisement>,
    output: mpsc::Sender<RawAdvertisement>,
}

impl EventProcessor {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut control: mpsc::Receiver<Control>,
        supervisor: JoinHandle<()>,
        error_slot: oneshot::Sender<TrackerError>,
    ) {
        let failure = loop {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::ClearCache) => {
                        debug!(devices = self.cache.len(), "clearing device cache");
                        self.cache.clear();
                    }
                    Some(Control::Fail(err)) => break Some(err),
                    None => break Some(TrackerError::SupervisorStopped),
                },
                () = self.output.closed() => {
                    debug!("advertisement receiver dropped, stopping tracker");
                    break None;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        break Some(TrackerError::TransportClosed);
                    };
                    match self.handle_event(event).await {
                        Ok(Some(adv)) => {
                            if self.output.send(adv).await.is_err() {
                                debug!("advertisement receiver dropped, stopping tracker");
                                break None;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to handle device event"),
                    }
                }
            }
        };

        supervisor.abort();
        if let Some(err) = failure {
            error!(error = %err, "advertisement tracker failed");
            let _ = error_slot.send(err);
        }
        // Dropping `self.output` here closes the stream.
    }

    /// Apply one event to the cache and return the advertisement to emit, if any.
    async fn handle_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<Option<RawAdvertisement>, EventError> {
        match event {
            TransportEvent::PropertiesChanged {
                key,
                interface,
                changed,
                ..
            } => {
                if interface != DEVICE_INTERFACE {
                    return Ok(None);
                }
                self.properties_changed(key, &changed).await
            }
            TransportEvent::InterfacesAdded { key, interfaces } => {
                let Some(props) = interfaces.get(DEVICE_INTERFACE) else {
                    return Ok(None);
                };
                let adv = RawAdvertisement::from_properties(props).map_err(|source| {
                    EventError::Parse {
                        key: key.clone(),
                        source,
                    }
                })?;
                Ok(self.store(key, adv))
            }
            TransportEvent::InterfacesRemoved { key, .. } => {
                self.cache.remove(&key);
                Ok(None)
            }
        }
    }

    async fn properties_changed(
        &mut self,
        key: DeviceKey,
        changed: &[DeviceProperty],
    ) -> Result<Option<RawAdvertisement>, EventError> {
        let (mut adv, mut dirty) = match self.cache.get(&key) {
            Some(adv) => (adv.clone(), false),
            None => {
                let props = self
                    .transport
                    .fetch_all_properties(&key)
                    .await
                    .map_err(|source| EventError::Fetch {
                        key: key.clone(),
                        source,
                    })?;
                let adv = RawAdvertisement::from_properties(&props).map_err(|source| {
                    EventError::Parse {
                        key: key.clone(),
                        source,
                    }
                })?;
                (adv, true)
            }
        };

        for prop in changed {
            match prop {
                DeviceProperty::ManufacturerData(md) => {
                    adv.manufacturer_data = md.clone();
                    dirty = true;
                }
                // A fresh RSSI means the device is still around; republish the
                // last payload it sent.
                DeviceProperty::Rssi(_) => dirty = true,
                DeviceProperty::Address(_) | DeviceProperty::Other(_) => {}
            }
        }

        if !dirty {
            return Ok(None);
        }
        Ok(self.store(key, adv))
    }

    /// Cache `adv` and return it when it is worth emitting.
    fn store(&mut self, key: DeviceKey, adv: RawAdvertisement) -> Option<RawAdvertisement> {
        let publish = adv.is_publishable().then(|| adv.clone());
        self.cache.insert(key, adv);
        publish
    }
}

#[derive(Debug, PartialEq)]
enum DiscoveryState {
    Starting,
    Polling,
    Restarting,
    Failed(TrackerError),
}

struct DiscoverySupervisor {
    transport: Arc<dyn Transport>,
    control: mpsc::Sender<Control>,
    options: TrackerOptions,
}

impl DiscoverySupervisor {
    async fn run(self) {
        let mut state = DiscoveryState::Starting;
        loop {
            state = match state {
                DiscoveryState::Starting => match self.start_discovery().await {
                    Ok(()) => {
                        info!("discovery started");
                        DiscoveryState::Polling
                    }
                    Err(e) => DiscoveryState::Failed(TrackerError::StartDiscovery(e)),
                },
                // BlueZ keeps discovering after a single StartDiscovery, but a
                // restarted daemon forgets about it.
                DiscoveryState::Polling => {
                    tokio::time::sleep(self.options.poll_interval).await;
                    match self.transport.is_discovering().await {
                        Ok(true) => DiscoveryState::Polling,
                        Ok(false) => DiscoveryState::Restarting,
                        Err(e) => DiscoveryState::Failed(TrackerError::DiscoveringStatus(e)),
                    }
                }
                DiscoveryState::Restarting => {
                    warn!("discovering stopped, restarting");
                    if self.control.send(Control::ClearCache).await.is_err() {
                        return;
                    }
                    DiscoveryState::Starting
                }
                DiscoveryState::Failed(err) => {
                    let _ = self.control.send(Control::Fail(err)).await;
                    return;
                }
            };
        }
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        let mut retry = 0;
        loop {
            tokio::time::sleep(self.options.start_backoff.delay(retry)).await;
            match self.transport.start_discovery().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && retry < self.options.start_retries => {
                    retry += 1;
                    warn!(error = %e, retry, "failed to start discovery, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
