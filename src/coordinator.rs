//! Multi-device coordinator.
//!
//! A [`DeviceCoordinator`] owns one [`SerialConnection`] per distinct port
//! identifier and re-emits their events on its own bus, labelled with the port
//! they came from:
//!
//! ```text
//! SerialConnection(A) ─┐ ConnectionEvent
//! SerialConnection(B) ─┼──────────────────> DeviceCoordinator bus ──> DeviceEvent{port, ..}
//! SerialConnection(C) ─┘
//! ```
//!
//! Forwarding is wired when a connection is built, so subscriptions made on
//! the coordinator survive [`set_devices`](DeviceCoordinator::set_devices).
//! Every connection scans the host on its own; the coordinator re-emits a
//! `ports-update` only when the list differs from the last one it forwarded.

use crate::connection::{ConnectionConfig, ConnectionSettings, SerialConnection};
use crate::events::{ConnectionEvent, DeviceEvent, EventBus, EventKind, SubscriptionId};
use crate::port::{
    PortEnumerator, PortError, SerialTransport, SystemPortEnumerator, Transport, TransportFactory,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Manages a set of connections keyed by port identifier.
///
/// # Example
/// ```no_run
/// use serialio::{ConnectionSettings, DeviceCoordinator};
///
/// let coordinator = DeviceCoordinator::new(["/dev/ttyUSB0", "/dev/ttyUSB1"], ConnectionSettings::default());
/// coordinator.on_data_incoming(|port, line| println!("{port}: {line}"));
/// coordinator.start_all();
/// coordinator.write("/dev/ttyUSB0", "PING", "\n");
/// ```
pub struct DeviceCoordinator {
    devices: Vec<SerialConnection>,
    settings: ConnectionSettings,
    factory: Arc<dyn TransportFactory>,
    enumerator: Arc<dyn PortEnumerator>,
    bus: Arc<EventBus<DeviceEvent>>,
    /// Last host port list re-emitted, shared by every forwarder.
    last_ports: Arc<Mutex<Vec<String>>>,
}

impl DeviceCoordinator {
    /// A coordinator over the real serial stack.
    pub fn new<I, S>(ports: I, settings: ConnectionSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let factory = |config: &ConnectionConfig| -> Box<dyn Transport> {
            Box::new(
                SerialTransport::new(config.port.clone(), config.settings.baud_rate)
                    .with_timeout(config.settings.read_timeout),
            )
        };
        Self::with_backend(ports, settings, Arc::new(factory), Arc::new(SystemPortEnumerator))
    }

    /// A coordinator whose transports come from `factory` and whose port
    /// scans go to `enumerator`.
    pub fn with_backend<I, S>(
        ports: I,
        settings: ConnectionSettings,
        factory: Arc<dyn TransportFactory>,
        enumerator: Arc<dyn PortEnumerator>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut coordinator = Self {
            devices: Vec::new(),
            settings,
            factory,
            enumerator,
            bus: Arc::new(EventBus::new()),
            last_ports: Arc::new(Mutex::new(Vec::new())),
        };
        coordinator.devices = coordinator.build_devices(ports);
        coordinator
    }

    fn build_devices<I, S>(&self, ports: I) -> Vec<SerialConnection>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        dedup_ports(ports)
            .into_iter()
            .map(|port| self.build_device(port))
            .collect()
    }

    fn build_device(&self, port: String) -> SerialConnection {
        let config = ConnectionConfig::for_port(port.clone(), &self.settings);
        let transport = self.factory.create(&config);
        let connection =
            SerialConnection::with_transport(config, transport, self.enumerator.clone());

        let bus = self.bus.clone();
        let last_ports = self.last_ports.clone();
        connection.forward_to(move |event| {
            if let ConnectionEvent::PortsUpdate(ports) = event {
                let mut last = last_ports.lock();
                if *last == *ports {
                    return;
                }
                *last = ports.clone();
            }
            bus.emit(&DeviceEvent::from_connection(&port, event));
        });
        connection
    }

    /// Start every managed connection.
    ///
    /// Failures are logged per device and do not stop the rest. Returns how
    /// many connections started.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for device in &self.devices {
            match device.start() {
                Ok(()) => started += 1,
                Err(e) => warn!(port = ?device.port(), "start failed: {e}"),
            }
        }
        info!(started, total = self.devices.len(), "devices started");
        started
    }

    /// Stop every managed connection.
    pub fn stop_all(&self) {
        for device in &self.devices {
            device.stop();
        }
    }

    /// Wait for every stopped connection's loop thread to exit.
    pub fn join_all(&self) {
        for device in &self.devices {
            device.join();
        }
    }

    /// Start the connection for `port`. Returns false if none matches.
    pub fn start_only(&self, port: &str) -> bool {
        match self.device(port) {
            Some(device) => {
                if let Err(e) = device.start() {
                    warn!(port, "start failed: {e}");
                }
                true
            }
            None => false,
        }
    }

    /// Stop the connection for `port`. Returns false if none matches.
    pub fn stop_only(&self, port: &str) -> bool {
        match self.device(port) {
            Some(device) => {
                device.stop();
                true
            }
            None => false,
        }
    }

    /// Write a line to the connection for `to`. Returns false if none matches.
    pub fn write(&self, to: &str, message: &str, line_ending: &str) -> bool {
        match self.device(to) {
            Some(device) => {
                device.write(message, line_ending);
                true
            }
            None => {
                debug!(port = to, "write to unmanaged port dropped");
                false
            }
        }
    }

    /// Replace the managed set. Every current connection is stopped first.
    ///
    /// Returns the retired connections, already stopped, so their threads can
    /// be joined. Dropping them is fine too.
    pub fn set_devices<I, S>(&mut self, ports: I) -> Vec<SerialConnection>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.has_devices() {
            self.stop_all();
        }
        let devices = self.build_devices(ports);
        let retired = std::mem::replace(&mut self.devices, devices);
        info!(count = self.devices.len(), retired = retired.len(), "device list replaced");
        retired
    }

    /// Replace the managed set and the settings new connections are built with.
    pub fn set_devices_with_settings<I, S>(
        &mut self,
        ports: I,
        settings: ConnectionSettings,
    ) -> Vec<SerialConnection>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings = settings;
        self.set_devices(ports)
    }

    /// Register `callback` for every device event of `kind`.
    ///
    /// `ConnectionStatus` and `DataIncoming` carry the originating port;
    /// `PortsUpdate` is passed through unlabelled, once per change no matter
    /// how many connections observed it.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    /// Remove a subscription made with any `on*` method.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.bus.off(id)
    }

    pub fn on_connection_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on(EventKind::ConnectionStatus, move |event| {
            if let DeviceEvent::ConnectionStatus { port, open } = event {
                callback(port, *open);
            }
        })
    }

    pub fn on_data_incoming<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on(EventKind::DataIncoming, move |event| {
            if let DeviceEvent::DataIncoming { port, line } = event {
                callback(port, line);
            }
        })
    }

    pub fn on_ports_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.on(EventKind::PortsUpdate, move |event| {
            if let DeviceEvent::PortsUpdate { ports } = event {
                callback(ports);
            }
        })
    }

    /// Receive every device event on a tokio channel.
    ///
    /// The subscription is dropped from the bus on the first event after the
    /// receiver goes away.
    pub fn event_stream(&self) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            let bus = Arc::downgrade(&self.bus);
            let id = Arc::new(Mutex::new(None::<SubscriptionId>));
            let slot = id.clone();
            let sub = self.bus.on(kind, move |event| {
                if tx.send(event.clone()).is_err() {
                    if let (Some(bus), Some(id)) = (bus.upgrade(), *slot.lock()) {
                        bus.off(id);
                    }
                }
            });
            *id.lock() = Some(sub);
        }
        rx
    }

    /// Ports currently present on the host.
    pub fn list_ports(&self) -> Result<Vec<String>, PortError> {
        self.enumerator.list_ports()
    }

    /// Managed ports whose transport is open right now.
    pub fn open_ports(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|device| device.is_open())
            .filter_map(SerialConnection::port)
            .collect()
    }

    /// The connection for `port`, if managed.
    pub fn device(&self, port: &str) -> Option<&SerialConnection> {
        self.devices
            .iter()
            .find(|device| device.port().as_deref() == Some(port))
    }

    /// All managed connections, in configuration order.
    pub fn devices(&self) -> &[SerialConnection] {
        &self.devices
    }

    /// Configured ports of all managed connections.
    pub fn ports(&self) -> Vec<String> {
        self.devices.iter().filter_map(SerialConnection::port).collect()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn has_devices(&self) -> bool {
        !self.is_empty()
    }
}

impl std::fmt::Debug for DeviceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCoordinator")
            .field("devices", &self.devices)
            .field("settings", &self.settings)
            .field("bus", &self.bus)
            .finish()
    }
}

/// Drop repeated identifiers, keeping the first occurrence's position.
pub fn dedup_ports<I, S>(ports: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    ports
        .into_iter()
        .map(Into::into)
        .filter(|port| seen.insert(port.clone()))
        .collect()
}
