//! Event-driven serial port connections.
//!
//! A [`SerialConnection`] keeps one port open on a background thread,
//! reconnecting when it drops and publishing what happens as events. A
//! [`DeviceCoordinator`] runs several of them and re-emits their events
//! labelled with the originating port.
//!
//! # Modules
//!
//! - `connection`: single-port state machine and poll loop
//! - `coordinator`: multi-device management and event aggregation
//! - `events`: event kinds, payloads and the subscription bus
//! - `port`: transport abstraction over `serialport`, plus mocks
//! - `config`: TOML configuration with environment overrides
//! - `logging`: tracing subscriber setup
//! - `error`: crate error type

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod port;

pub use connection::{
    ConnectionConfig, ConnectionSettings, ConnectionState, Lifecycle, SerialConnection,
    DEFAULT_BAUD_RATE, DEFAULT_MAX_READ_ATTEMPTS, DEFAULT_PORT_REFRESH_INTERVAL,
    DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_DELAY,
};
pub use coordinator::{dedup_ports, DeviceCoordinator};
pub use error::{Error, Result};
pub use events::{
    BusEvent, ConnectionEvent, DeviceEvent, EventBus, EventKind, SubscriptionId, UnknownEvent,
};
pub use port::{
    MockEnumerator, MockTransport, PortEnumerator, PortError, SerialTransport,
    SystemPortEnumerator, Transport, TransportFactory,
};

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
