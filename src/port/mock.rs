//! Mock transport and enumerator for testing.
//!
//! Both mocks are cheap to clone and share their state, so a test keeps one
//! clone as a control handle while the connection owns the other.

use super::error::PortError;
use super::traits::{PortEnumerator, Transport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A queued outcome for the next `read_line` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    /// Return these bytes.
    Line(Vec<u8>),
    /// Fail with an I/O error carrying this message.
    Fail(String),
}

#[derive(Debug)]
struct MockTransportState {
    port: Option<String>,
    baud_rate: u32,
    open: bool,
    /// Whether the device is plugged in; `open()` fails otherwise.
    present: bool,
    reads: VecDeque<MockRead>,
    /// Returned as a failure once the queue is empty, if set.
    read_failure: Option<String>,
    /// Simulated read timeout when nothing is queued.
    idle_read_delay: Duration,
    write_log: Vec<Vec<u8>>,
    fail_writes: bool,
    open_attempts: Vec<Instant>,
    close_count: usize,
}

/// Mock serial transport.
///
/// # Example
/// ```
/// use serialio::port::{MockTransport, Transport};
///
/// let mut port = MockTransport::new("MOCK0");
/// let control = port.clone();
///
/// port.open().unwrap();
/// control.enqueue_line(b"Hello\n");
/// assert_eq!(port.read_line().unwrap(), b"Hello\n");
///
/// port.write_bytes(b"Response").unwrap();
/// assert_eq!(control.write_log(), vec![b"Response".to_vec()]);
/// ```
#[derive(Clone, Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    /// A present, closed device named `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self::build(Some(port.into()))
    }

    /// A transport with no port identifier configured.
    pub fn unconfigured() -> Self {
        Self::build(None)
    }

    fn build(port: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockTransportState {
                port,
                baud_rate: 9600,
                open: false,
                present: true,
                reads: VecDeque::new(),
                read_failure: None,
                idle_read_delay: Duration::from_millis(5),
                write_log: Vec::new(),
                fail_writes: false,
                open_attempts: Vec::new(),
                close_count: 0,
            })),
        }
    }

    /// Queue a successful read.
    pub fn enqueue_line(&self, data: &[u8]) {
        self.state.lock().reads.push_back(MockRead::Line(data.to_vec()));
    }

    /// Queue a failing read.
    pub fn enqueue_failure(&self, message: impl Into<String>) {
        self.state.lock().reads.push_back(MockRead::Fail(message.into()));
    }

    /// Make every read fail once the queue drains (`None` to stop).
    pub fn set_read_failure(&self, message: Option<String>) {
        self.state.lock().read_failure = message;
    }

    /// Plug or unplug the device. Unplugging does not close an open handle;
    /// reads keep failing until the connection gives up on it.
    pub fn set_present(&self, present: bool) {
        let mut state = self.state.lock();
        state.present = present;
        state.read_failure = if present {
            None
        } else {
            Some("device unplugged".to_string())
        };
    }

    /// Make writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// How long an empty read blocks before returning nothing.
    pub fn set_idle_read_delay(&self, delay: Duration) {
        self.state.lock().idle_read_delay = delay;
    }

    /// Open the port directly, as if a previous attempt had succeeded.
    pub fn force_open(&self) {
        self.state.lock().open = true;
    }

    /// Every `open()` call so far, in order.
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.state.lock().open_attempts.clone()
    }

    /// Number of `close()` calls so far.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Everything written so far, one entry per write.
    pub fn write_log(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.state.lock().baud_rate
    }

    /// Number of reads still queued.
    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        state.open_attempts.push(Instant::now());
        let port = state.port.clone().ok_or(PortError::NoPortConfigured)?;
        if !state.present {
            return Err(PortError::not_found(port));
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        let mut state = self.state.lock();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn read_line(&mut self) -> Result<Vec<u8>, PortError> {
        let delay = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(PortError::NotOpen);
            }
            match state.reads.pop_front() {
                Some(MockRead::Line(data)) => return Ok(data),
                Some(MockRead::Fail(message)) => {
                    return Err(PortError::Io(std::io::Error::other(message)))
                }
                None => {
                    if let Some(message) = state.read_failure.clone() {
                        return Err(PortError::Io(std::io::Error::other(message)));
                    }
                }
            }
            state.idle_read_delay
        };

        // Release the lock before blocking so control handles stay usable.
        std::thread::sleep(delay);
        Ok(Vec::new())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(PortError::NotOpen);
        }
        if state.fail_writes {
            return Err(PortError::Io(std::io::Error::other("write failed")));
        }
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn port(&self) -> Option<String> {
        self.state.lock().port.clone()
    }

    fn set_port(&mut self, port: Option<String>) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.open {
            return Err(PortError::AlreadyOpen);
        }
        state.port = port;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.open {
            return Err(PortError::AlreadyOpen);
        }
        state.baud_rate = baud_rate;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockEnumeratorState {
    ports: Vec<String>,
    fail: bool,
    scans: usize,
}

/// Mock port enumerator returning a settable device list.
#[derive(Clone, Debug, Default)]
pub struct MockEnumerator {
    state: Arc<Mutex<MockEnumeratorState>>,
}

impl MockEnumerator {
    /// An enumerator reporting `ports`.
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let enumerator = Self::default();
        enumerator.set_ports(ports);
        enumerator
    }

    /// Replace the reported device list.
    pub fn set_ports<I, S>(&self, ports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().ports = ports.into_iter().map(Into::into).collect();
    }

    /// Make `list_ports` fail.
    pub fn set_fail(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    /// Number of `list_ports` calls so far.
    pub fn scan_count(&self) -> usize {
        self.state.lock().scans
    }
}

impl PortEnumerator for MockEnumerator {
    fn list_ports(&self) -> Result<Vec<String>, PortError> {
        let mut state = self.state.lock();
        state.scans += 1;
        if state.fail {
            return Err(PortError::Io(std::io::Error::other("enumeration failed")));
        }
        Ok(state.ports.clone())
    }
}
