//! Shared test utilities for serialio integration tests.
//!
//! This module provides common test infrastructure including:
//! - Mock-backed connections and coordinators
//! - Event recorders for both bus scopes
//! - Polling helpers for asserting on background threads

#![allow(dead_code)]

use parking_lot::Mutex;
use serialio::port::{MockEnumerator, MockTransport, Transport, TransportFactory};
use serialio::{
    ConnectionConfig, ConnectionEvent, ConnectionSettings, DeviceCoordinator, DeviceEvent,
    EventKind, SerialConnection,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for anything a background loop is expected to do.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Settings tuned for tests: short delays, port scanning off.
pub fn fast_settings(reconnect_delay: Duration) -> ConnectionSettings {
    ConnectionSettings {
        reconnect_delay,
        port_refresh_interval: Duration::ZERO,
        read_timeout: Duration::from_millis(10),
        ..ConnectionSettings::default()
    }
}

/// Build a connection over a fresh mock transport and enumerator.
///
/// Returns the connection plus control handles for both mocks.
///
/// # Example
/// ```ignore
/// let (conn, port, _ports) = mock_connection(ConnectionConfig::new("MOCK0"));
/// port.enqueue_line(b"hello\n");
/// conn.start().unwrap();
/// ```
pub fn mock_connection(
    config: ConnectionConfig,
) -> (SerialConnection, MockTransport, MockEnumerator) {
    let transport = MockTransport::new("unset");
    transport.set_idle_read_delay(Duration::from_millis(2));
    let enumerator = MockEnumerator::default();
    let connection = SerialConnection::with_transport(
        config,
        Box::new(transport.clone()),
        Arc::new(enumerator.clone()),
    );
    (connection, transport, enumerator)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Thread-safe list of received events.
pub struct EventLog<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E> Clone for EventLog<E> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventLog<E> {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, event: &E) {
        self.events.lock().push(event.clone());
    }

    pub fn snapshot(&self) -> Vec<E> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Wait until at least `count` events were recorded.
    pub fn wait_for(&self, count: usize) -> bool {
        wait_until(PATIENCE, || self.len() >= count)
    }

    /// Wait until some recorded event matches.
    pub fn wait_for_match(&self, predicate: impl Fn(&E) -> bool) -> bool {
        wait_until(PATIENCE, || self.events.lock().iter().any(&predicate))
    }
}

/// Record every event a connection emits.
pub fn record_connection(connection: &SerialConnection) -> EventLog<ConnectionEvent> {
    let log = EventLog::new();
    for kind in EventKind::ALL {
        let sink = log.clone();
        connection.on(kind, move |event| sink.push(event));
    }
    log
}

/// Record every event a coordinator re-emits.
pub fn record_coordinator(coordinator: &DeviceCoordinator) -> EventLog<DeviceEvent> {
    let log = EventLog::new();
    for kind in EventKind::ALL {
        let sink = log.clone();
        coordinator.on(kind, move |event| sink.push(event));
    }
    log
}

/// Transport factory that hands out mocks and keeps a control handle to each.
#[derive(Clone, Default)]
pub struct MockFactory {
    created: Arc<Mutex<Vec<(String, MockTransport)>>>,
    absent: Arc<Mutex<HashSet<String>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created for these ports start unplugged.
    pub fn with_absent<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let factory = Self::default();
        factory
            .absent
            .lock()
            .extend(ports.into_iter().map(Into::into));
        factory
    }

    /// Ports in creation order.
    pub fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .iter()
            .map(|(port, _)| port.clone())
            .collect()
    }

    /// Control handle for the most recent transport created for `port`.
    pub fn transport(&self, port: &str) -> MockTransport {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(p, _)| p == port)
            .map(|(_, transport)| transport.clone())
            .unwrap_or_else(|| panic!("no transport created for {port}"))
    }

    /// A coordinator over this factory and `enumerator`.
    pub fn coordinator<I, S>(
        &self,
        ports: I,
        settings: ConnectionSettings,
        enumerator: MockEnumerator,
    ) -> DeviceCoordinator
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DeviceCoordinator::with_backend(
            ports,
            settings,
            Arc::new(self.clone()),
            Arc::new(enumerator),
        )
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        let port = config.port.clone().unwrap_or_default();
        let transport = MockTransport::new(port.clone());
        transport.set_idle_read_delay(Duration::from_millis(2));
        if self.absent.lock().contains(&port) {
            transport.set_present(false);
        }
        self.created.lock().push((port, transport.clone()));
        Box::new(transport)
    }
}
