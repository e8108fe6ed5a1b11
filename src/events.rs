//! Event bus for connection and coordinator events.
//!
//! Every [`SerialConnection`](crate::SerialConnection) and
//! [`DeviceCoordinator`](crate::DeviceCoordinator) owns one [`EventBus`].
//! Events are closed enums with typed payloads; a subscription is keyed by the
//! [`EventKind`] of the events it wants.
//!
//! Dispatch is synchronous, on the emitting thread, in registration order. A
//! panicking callback is caught and logged so the remaining callbacks (and the
//! poll loop that emitted the event) keep running.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// The kinds of event a bus can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The transport opened or closed.
    ConnectionStatus,
    /// A non-empty line arrived.
    DataIncoming,
    /// The set of ports present on the host changed.
    PortsUpdate,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 3] = [
        EventKind::ConnectionStatus,
        EventKind::DataIncoming,
        EventKind::PortsUpdate,
    ];

    /// The wire name of this kind, e.g. `"connection-status"`.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::ConnectionStatus => "connection-status",
            EventKind::DataIncoming => "data-incoming",
            EventKind::PortsUpdate => "ports-update",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an event name that no bus emits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event name: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// Anything that can travel over an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// The subscription key this event is delivered to.
    fn kind(&self) -> EventKind;
}

/// Events emitted by a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ConnectionEvent {
    /// New open state of the transport.
    ConnectionStatus(bool),
    /// A decoded line with trailing whitespace removed.
    DataIncoming(String),
    /// The full, ordered list of ports now present.
    PortsUpdate(Vec<String>),
}

impl BusEvent for ConnectionEvent {
    fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            ConnectionEvent::DataIncoming(_) => EventKind::DataIncoming,
            ConnectionEvent::PortsUpdate(_) => EventKind::PortsUpdate,
        }
    }
}

/// Events re-emitted by a coordinator, labelled with the originating port.
///
/// `PortsUpdate` describes the host rather than one device, so it carries no
/// label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeviceEvent {
    ConnectionStatus { port: String, open: bool },
    DataIncoming { port: String, line: String },
    PortsUpdate { ports: Vec<String> },
}

impl DeviceEvent {
    /// Label a connection event with the port it came from.
    pub fn from_connection(port: &str, event: &ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::ConnectionStatus(open) => DeviceEvent::ConnectionStatus {
                port: port.to_string(),
                open: *open,
            },
            ConnectionEvent::DataIncoming(line) => DeviceEvent::DataIncoming {
                port: port.to_string(),
                line: line.clone(),
            },
            ConnectionEvent::PortsUpdate(ports) => DeviceEvent::PortsUpdate {
                ports: ports.clone(),
            },
        }
    }

    /// The originating port, if the event is device-specific.
    pub fn port(&self) -> Option<&str> {
        match self {
            DeviceEvent::ConnectionStatus { port, .. } | DeviceEvent::DataIncoming { port, .. } => {
                Some(port)
            }
            DeviceEvent::PortsUpdate { .. } => None,
        }
    }
}

impl BusEvent for DeviceEvent {
    fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::ConnectionStatus { .. } => EventKind::ConnectionStatus,
            DeviceEvent::DataIncoming { .. } => EventKind::DataIncoming,
            DeviceEvent::PortsUpdate { .. } => EventKind::PortsUpdate,
        }
    }
}

/// Subscription handle for unsubscribing from events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Per-instance registry of callbacks keyed by event kind.
pub struct EventBus<E> {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler<E>)>>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `callback` for every event of `kind`.
    ///
    /// Callbacks for the same kind run in the order they were registered.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        tracing::debug!(%id, event = %kind, "subscription added");
        id
    }

    /// Remove a subscription.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
        }
        if removed {
            tracing::debug!(%id, "subscription removed");
        }
        removed
    }

    /// Deliver `event` to every callback registered for its kind.
    ///
    /// Returns the number of callbacks that ran to completion.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<(SubscriptionId, Handler<E>)> = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(%id, event = %kind, %reason, "event callback panicked");
                }
            }
        }
        delivered
    }

    /// Number of callbacks registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<&'static str, usize> = handlers
            .iter()
            .map(|(kind, list)| (kind.name(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}
