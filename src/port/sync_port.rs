//! Blocking serial transport backed by the `serialport` crate.
//!
//! Wraps `serialport::SerialPort` with our own [`Transport`] trait and adds
//! newline framing on top of raw reads.

use super::error::PortError;
use super::traits::{PortEnumerator, Transport};
use crate::connection::DEFAULT_READ_TIMEOUT;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// Lines longer than this are handed out without a terminator.
pub const MAX_LINE_LEN: usize = 4096;

const READ_CHUNK: usize = 256;

/// Serial transport wrapping `serialport::SerialPort`.
pub struct SerialTransport {
    /// Open handle, `None` while closed.
    handle: Option<Box<dyn serialport::SerialPort>>,
    port: Option<String>,
    baud_rate: u32,
    timeout: Duration,
    terminator: u8,
    /// Bytes received but not yet returned as a line.
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Create a closed transport for `port`.
    ///
    /// # Example
    /// ```no_run
    /// use serialio::port::{SerialTransport, Transport};
    ///
    /// let mut transport = SerialTransport::new(Some("/dev/ttyUSB0".into()), 115_200);
    /// transport.open()?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(port: Option<String>, baud_rate: u32) -> Self {
        Self {
            handle: None,
            port,
            baud_rate,
            timeout: DEFAULT_READ_TIMEOUT,
            terminator: b'\n',
            pending: Vec::new(),
        }
    }

    /// Set the read timeout used by `read_line`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the byte that terminates a line.
    pub fn with_terminator(mut self, terminator: u8) -> Self {
        self.terminator = terminator;
        self
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = memchr::memchr(self.terminator, &self.pending) {
            let rest = self.pending.split_off(pos + 1);
            return Some(std::mem::replace(&mut self.pending, rest));
        }
        if self.pending.len() >= MAX_LINE_LEN {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), PortError> {
        let port_name = self.port.as_deref().ok_or(PortError::NoPortConfigured)?;

        let handle = serialport::new(port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => PortError::not_found(port_name),
                serialport::ErrorKind::InvalidInput => PortError::config(e.to_string()),
                _ => PortError::Serial(e),
            })?;

        self.pending.clear();
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        // Dropping the handle releases the OS descriptor.
        self.handle = None;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn read_line(&mut self) -> Result<Vec<u8>, PortError> {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let handle = self.handle.as_mut().ok_or(PortError::NotOpen)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match handle.read(&mut chunk) {
                Ok(0) => {
                    let name = self.port.clone().unwrap_or_default();
                    return Err(PortError::disconnected(name));
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = memchr::memchr(self.terminator, &self.pending) {
                        let rest = self.pending.split_off(pos + 1);
                        return Ok(std::mem::replace(&mut self.pending, rest));
                    }
                    if self.pending.len() >= MAX_LINE_LEN {
                        return Ok(std::mem::take(&mut self.pending));
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(Vec::new()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PortError::Io(e)),
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let handle = self.handle.as_mut().ok_or(PortError::NotOpen)?;
        handle.write_all(data)?;
        handle.flush()?;
        Ok(data.len())
    }

    fn port(&self) -> Option<String> {
        self.port.clone()
    }

    fn set_port(&mut self, port: Option<String>) -> Result<(), PortError> {
        if self.is_open() {
            return Err(PortError::AlreadyOpen);
        }
        self.port = port;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError> {
        if self.is_open() {
            return Err(PortError::AlreadyOpen);
        }
        self.baud_rate = baud_rate;
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Enumerates ports through `serialport::available_ports`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortEnumerator;

impl PortEnumerator for SystemPortEnumerator {
    fn list_ports(&self) -> Result<Vec<String>, PortError> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}
