//! Core traits for the transport and port-enumeration collaborators.
//!
//! A connection never talks to `serialport` directly. It drives a boxed
//! [`Transport`] and asks a shared [`PortEnumerator`] for the device list, so
//! real hardware and the in-memory mocks are interchangeable.

use super::error::PortError;
use crate::connection::ConnectionConfig;

/// Line-oriented serial transport.
///
/// Implementations hold the port identifier and baud rate themselves; both may
/// only be changed while the transport is closed.
pub trait Transport: Send + std::fmt::Debug {
    /// Open the configured port.
    ///
    /// Fails with [`PortError::NoPortConfigured`] when no identifier is set.
    fn open(&mut self) -> Result<(), PortError>;

    /// Close the port. Closing a closed transport is a no-op.
    fn close(&mut self) -> Result<(), PortError>;

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Read one line, terminator included if it arrived.
    ///
    /// Blocks at most for the transport's own read timeout. A timeout with no
    /// complete line yields `Ok` with an empty buffer.
    fn read_line(&mut self) -> Result<Vec<u8>, PortError>;

    /// Write bytes to the port.
    ///
    /// Returns the number of bytes actually written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError>;

    /// The configured port identifier, if any.
    fn port(&self) -> Option<String>;

    /// Replace the port identifier. Fails with [`PortError::AlreadyOpen`]
    /// while open.
    fn set_port(&mut self, port: Option<String>) -> Result<(), PortError>;

    /// Replace the baud rate. Fails with [`PortError::AlreadyOpen`] while open.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError>;
}

/// Source of the identifiers of the serial devices present on this host.
pub trait PortEnumerator: Send + Sync + std::fmt::Debug {
    /// Current device identifiers in platform enumeration order.
    fn list_ports(&self) -> Result<Vec<String>, PortError>;
}

/// Builds a transport for a connection config.
///
/// The coordinator calls this once per managed device. Any
/// `Fn(&ConnectionConfig) -> Box<dyn Transport>` closure qualifies.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ConnectionConfig) -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        self(config)
    }
}
