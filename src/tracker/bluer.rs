//! BlueZ D-Bus transport.
//!
//! Uses the `bluer` crate to talk to the BlueZ daemon, which must be running.
//! Adapter and device events are translated into [`TransportEvent`]s keyed by
//! the device's D-Bus object path.

use super::{
    DEVICE_INTERFACE, EVENT_CHANNEL_BUFFER_SIZE, Transport, TransportError, TransportEvent,
    TransportFuture,
};
use crate::advertisement::{DeviceKey, DeviceProperty};
use crate::mac_address::MacAddress;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, ErrorKind, Session};
use futures::{StreamExt, pin_mut};
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            ErrorKind::NotReady => TransportError::NotReady(err.message),
            _ => TransportError::Bluetooth(err.to_string()),
        }
    }
}

/// Transport backed by a single BlueZ adapter.
pub struct BluerTransport {
    _session: Session,
    adapter: Adapter,
    adapter_path: String,
    discovery: Mutex<Option<JoinHandle<()>>>,
    pump: JoinHandle<()>,
}

impl BluerTransport {
    /// Connect to the system bus and start forwarding device events of
    /// `adapter_name` (for example `hci0`).
    pub async fn connect(
        adapter_name: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let session = Session::new().await?;
        let names = session.adapter_names().await?;
        if !names.iter().any(|name| name == adapter_name) {
            return Err(TransportError::AdapterNotFound(adapter_name.to_string()));
        }
        let adapter = session.adapter(adapter_name)?;
        adapter.set_powered(true).await?;
        let address = MacAddress::from(adapter.address().await?);
        info!(adapter = adapter_name, %address, "using Bluetooth adapter");

        let adapter_path = format!("/org/bluez/{adapter_name}");
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        let pump = tokio::spawn(pump_events(adapter.clone(), adapter_path.clone(), tx));

        let transport = BluerTransport {
            _session: session,
            adapter,
            adapter_path,
            discovery: Mutex::new(None),
            pump,
        };
        Ok((transport, rx))
    }

    fn address_of(&self, key: &DeviceKey) -> Result<Address, TransportError> {
        key.0
            .strip_prefix(&self.adapter_path)
            .and_then(|rest| rest.strip_prefix("/dev_"))
            .and_then(|mac| mac.parse::<MacAddress>().ok())
            .map(Address::from)
            .ok_or_else(|| TransportError::Bluetooth(format!("unknown device {key}")))
    }
}

impl Drop for BluerTransport {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(discovery) = self.discovery.get_mut().take() {
            discovery.abort();
        }
    }
}

impl Transport for BluerTransport {
    fn fetch_all_properties<'a>(
        &'a self,
        key: &'a DeviceKey,
    ) -> TransportFuture<'a, Vec<DeviceProperty>> {
        Box::pin(async move {
            let device = self.adapter.device(self.address_of(key)?)?;
            let props = device.all_properties().await?;
            Ok(props.into_iter().map(convert_property).collect())
        })
    }

    fn start_discovery(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            // Discovery lasts as long as the stream returned by BlueZ is
            // alive, so a task holds on to it and drains it.
            let (ready_tx, ready_rx) = oneshot::channel();
            let adapter = self.adapter.clone();
            let handle = tokio::spawn(async move {
                let stream = match adapter.discover_devices().await {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                pin_mut!(stream);
                while stream.next().await.is_some() {}
                debug!("discovery stream ended");
            });

            match ready_rx.await {
                Ok(Ok(())) => {
                    if let Some(previous) = self.discovery.lock().await.replace(handle) {
                        previous.abort();
                    }
                    Ok(())
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TransportError::Bluetooth(
                    "discovery task stopped before starting".to_string(),
                )),
            }
        })
    }

    fn is_discovering(&self) -> TransportFuture<'_, bool> {
        Box::pin(async move { Ok(self.adapter.is_discovering().await?) })
    }
}

fn device_key(adapter_path: &str, address: Address) -> DeviceKey {
    let mac = MacAddress::from(address).to_string().replace(':', "_");
    DeviceKey(format!("{adapter_path}/dev_{mac}"))
}

fn convert_property(prop: bluer::DeviceProperty) -> DeviceProperty {
    match prop {
        bluer::DeviceProperty::RemoteAddress(addr) => DeviceProperty::Address(addr.into()),
        bluer::DeviceProperty::ManufacturerData(md) => {
            DeviceProperty::ManufacturerData(md.into_iter().collect())
        }
        bluer::DeviceProperty::Rssi(rssi) => DeviceProperty::Rssi(rssi),
        other => DeviceProperty::Other(property_name(&other).to_string()),
    }
}

/// D-Bus name of a property the tracker ignores, for logging.
fn property_name(prop: &bluer::DeviceProperty) -> &'static str {
    use bluer::DeviceProperty as P;
    match prop {
        P::Name(_) => "Name",
        P::Alias(_) => "Alias",
        P::TxPower(_) => "TxPower",
        P::ServiceData(_) => "ServiceData",
        P::Connected(_) => "Connected",
        P::Paired(_) => "Paired",
        P::Trusted(_) => "Trusted",
        P::ServicesResolved(_) => "ServicesResolved",
        _ => "other",
    }
}

/// Forward adapter events, and the property changes of every known device,
/// until the adapter goes away or the receiver is dropped.
async fn pump_events(adapter: Adapter, adapter_path: String, tx: mpsc::Sender<TransportEvent>) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "failed to subscribe to adapter events");
            return;
        }
    };
    pin_mut!(events);

    let mut watchers: HashMap<Address, JoinHandle<()>> = HashMap::new();

    // Devices BlueZ already knows about only report changes; their properties
    // are fetched on the first one.
    match adapter.device_addresses().await {
        Ok(addresses) => {
            for address in addresses {
                let key = device_key(&adapter_path, address);
                let watcher = tokio::spawn(watch_device(adapter.clone(), address, key, tx.clone()));
                watchers.insert(address, watcher);
            }
        }
        Err(e) => warn!(error = %e, "failed to list known devices"),
    }

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => {
                let key = device_key(&adapter_path, address);
                let props = match adapter.device(address) {
                    Ok(device) => device.all_properties().await,
                    Err(e) => Err(e),
                };
                match props {
                    Ok(props) => {
                        let interfaces = HashMap::from([(
                            DEVICE_INTERFACE.to_string(),
                            props.into_iter().map(convert_property).collect(),
                        )]);
                        let added = TransportEvent::InterfacesAdded {
                            key: key.clone(),
                            interfaces,
                        };
                        if tx.send(added).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(device = %key, error = %e, "failed to read properties of new device"),
                }
                let watcher = tokio::spawn(watch_device(adapter.clone(), address, key, tx.clone()));
                if let Some(previous) = watchers.insert(address, watcher) {
                    previous.abort();
                }
            }
            AdapterEvent::DeviceRemoved(address) => {
                if let Some(watcher) = watchers.remove(&address) {
                    watcher.abort();
                }
                let removed = TransportEvent::InterfacesRemoved {
                    key: device_key(&adapter_path, address),
                    interfaces: vec![DEVICE_INTERFACE.to_string()],
                };
                if tx.send(removed).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }

    for (_, watcher) in watchers {
        watcher.abort();
    }
    debug!("adapter event stream ended");
}

async fn watch_device(
    adapter: Adapter,
    address: Address,
    key: DeviceKey,
    tx: mpsc::Sender<TransportEvent>,
) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            warn!(device = %key, error = %e, "failed to open device");
            return;
        }
    };
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(device = %key, error = %e, "failed to subscribe to device events");
            return;
        }
    };
    pin_mut!(events);

    while let Some(DeviceEvent::PropertyChanged(prop)) = events.next().await {
        let event = TransportEvent::PropertiesChanged {
            key: key.clone(),
            interface: DEVICE_INTERFACE.to_string(),
            changed: vec![convert_property(prop)],
            invalidated: Vec::new(),
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}
