//! Per-device connection state machine.
//!
//! A [`SerialConnection`] owns one [`Transport`] and, once started, runs a poll
//! cycle on its own thread:
//!
//! 1. emit `connection-status` if the open state changed since last cycle,
//! 2. read one line if open, otherwise try to (re)open and wait
//!    `reconnect_delay`,
//! 3. every `port_refresh_interval`, rescan the host's ports and emit
//!    `ports-update` when the list changed.
//!
//! Transport failures never escape the loop. They are logged, and repeated
//! read failures are treated as a disconnect.

use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, EventBus, EventKind, SubscriptionId};
use crate::port::{PortEnumerator, PortError, SerialTransport, SystemPortEnumerator, Transport};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// Default connection constants
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_READ_ATTEMPTS: u32 = 10;
pub const DEFAULT_PORT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Port-independent connection parameters, shared by every device a
/// coordinator manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub baud_rate: u32,
    /// Wait between reconnect attempts while the port is closed.
    pub reconnect_delay: Duration,
    /// Consecutive read failures tolerated before the port is force-closed.
    pub max_read_attempts: u32,
    /// How often to rescan the host's ports. Zero disables scanning.
    pub port_refresh_interval: Duration,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
            port_refresh_interval: DEFAULT_PORT_REFRESH_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Full configuration of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device identifier; `None` means never try to open.
    pub port: Option<String>,
    #[serde(flatten)]
    pub settings: ConnectionSettings,
}

impl ConnectionConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self::for_port(port, &ConnectionSettings::default())
    }

    /// Combine a port identifier with shared settings.
    pub fn for_port(port: impl Into<String>, settings: &ConnectionSettings) -> Self {
        Self {
            port: Some(port.into()),
            settings: settings.clone(),
        }
    }

    /// A config with no port; the connection stays closed until attached.
    pub fn detached(settings: &ConnectionSettings) -> Self {
        Self {
            port: None,
            settings: settings.clone(),
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.settings.reconnect_delay = delay;
        self
    }

    pub fn with_max_read_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_read_attempts = attempts;
        self
    }

    pub fn with_port_refresh_interval(mut self, interval: Duration) -> Self {
        self.settings.port_refresh_interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.settings.read_timeout = timeout;
        self
    }
}

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Constructed, loop not started.
    Idle,
    /// Loop thread active.
    Running,
    /// Terminal. A new connection is needed to run again.
    Stopped,
}

/// Snapshot of the loop's bookkeeping, published after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_running: bool,
    pub is_open: bool,
    pub last_known_open: bool,
    pub failed_read_attempts: u32,
    pub elapsed_since_last_scan: Duration,
    pub last_known_ports: Vec<String>,
}

/// Running flag plus the condvar that doubles as an interruptible timer.
#[derive(Debug)]
struct RunSignal {
    lifecycle: Mutex<Lifecycle>,
    wake: Condvar,
}

impl RunSignal {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Idle),
            wake: Condvar::new(),
        }
    }

    fn get(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Block for `delay` unless stopped first. Returns false once stopped.
    ///
    /// A delay too large to express as a deadline waits until stopped.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now().checked_add(delay);
        let mut lifecycle = self.lifecycle.lock();
        while *lifecycle != Lifecycle::Stopped {
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut lifecycle, deadline).timed_out() {
                        break;
                    }
                }
                None => self.wake.wait(&mut lifecycle),
            }
        }
        *lifecycle != Lifecycle::Stopped
    }

    /// Move to `Stopped`. Returns the previous lifecycle.
    fn stop(&self) -> Lifecycle {
        let mut lifecycle = self.lifecycle.lock();
        let previous = *lifecycle;
        *lifecycle = Lifecycle::Stopped;
        self.wake.notify_all();
        previous
    }
}

/// State shared between the handle and its loop thread.
struct Shared {
    config: RwLock<ConnectionConfig>,
    transport: Mutex<Box<dyn Transport>>,
    enumerator: Arc<dyn PortEnumerator>,
    bus: EventBus<ConnectionEvent>,
    signal: RunSignal,
    snapshot: Mutex<ConnectionState>,
}

impl Shared {
    fn label(&self) -> String {
        self.config
            .read()
            .port
            .clone()
            .unwrap_or_else(|| "<none>".to_string())
    }

    fn run(&self) {
        let mut state = self.snapshot.lock().clone();
        info!(port = %self.label(), "poll loop started");
        while self.signal.get() == Lifecycle::Running {
            self.poll_cycle(&mut state);
        }
        // `stop()` may have found the transport busy; close it here instead.
        self.close_transport("poll loop exiting");
        state.is_open = false;
        state.is_running = false;
        *self.snapshot.lock() = state;
        info!(port = %self.label(), "poll loop stopped");
    }

    fn poll_cycle(&self, state: &mut ConnectionState) {
        let started = Instant::now();
        let settings = self.config.read().settings.clone();

        let open = self.transport.lock().is_open();
        state.is_open = open;
        if open != state.last_known_open {
            state.last_known_open = open;
            info!(port = %self.label(), open, "connection status changed");
            self.bus.emit(&ConnectionEvent::ConnectionStatus(open));
        }

        if open {
            self.read_once(state, settings.max_read_attempts);
        } else {
            if self.config.read().port.is_some() {
                self.reconnect();
            }
            if !self.signal.sleep(settings.reconnect_delay) {
                state.is_running = false;
                *self.snapshot.lock() = state.clone();
                return;
            }
        }

        if !settings.port_refresh_interval.is_zero() {
            state.elapsed_since_last_scan += started.elapsed();
            if state.elapsed_since_last_scan >= settings.port_refresh_interval {
                state.elapsed_since_last_scan = Duration::ZERO;
                self.scan_ports(state);
            }
        }

        state.is_running = self.signal.get() == Lifecycle::Running;
        *self.snapshot.lock() = state.clone();
    }

    fn read_once(&self, state: &mut ConnectionState, max_read_attempts: u32) {
        // The transport lock is released before any callback runs.
        let result = self.transport.lock().read_line();
        match result {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let line = text.trim_end();
                if !line.is_empty() {
                    debug!(port = %self.label(), len = line.len(), "line received");
                    self.bus.emit(&ConnectionEvent::DataIncoming(line.to_string()));
                }
            }
            Err(e) => {
                state.failed_read_attempts += 1;
                warn!(
                    port = %self.label(),
                    attempt = state.failed_read_attempts,
                    max = max_read_attempts,
                    "read failed: {e}"
                );
                if state.failed_read_attempts >= max_read_attempts {
                    state.failed_read_attempts = 0;
                    self.close_transport("read attempts exhausted");
                }
            }
        }
    }

    fn reconnect(&self) {
        let port = self.label();
        let mut transport = self.transport.lock();
        if transport.is_open() {
            if let Err(e) = transport.close() {
                debug!(%port, "closing stale handle failed: {e}");
            }
        }
        match transport.open() {
            Ok(()) => info!(%port, "port opened"),
            Err(e) => debug!(%port, "connection attempt failed: {e}"),
        }
    }

    fn scan_ports(&self, state: &mut ConnectionState) {
        match self.enumerator.list_ports() {
            Ok(ports) if ports != state.last_known_ports => {
                debug!(port = %self.label(), count = ports.len(), "port list changed");
                state.last_known_ports = ports.clone();
                self.bus.emit(&ConnectionEvent::PortsUpdate(ports));
            }
            Ok(_) => {}
            Err(e) => warn!(port = %self.label(), "port scan failed: {e}"),
        }
    }

    // Lock order is config before transport, so labels are taken up front.
    fn close_transport(&self, reason: &str) {
        let port = self.label();
        let mut transport = self.transport.lock();
        if transport.is_open() {
            match transport.close() {
                Ok(()) => info!(%port, reason, "port closed"),
                Err(e) => warn!(%port, reason, "close failed: {e}"),
            }
        }
    }
}

/// One serial device with its own reconnecting poll loop.
///
/// # Example
/// ```no_run
/// use serialio::{ConnectionConfig, SerialConnection};
///
/// let connection = SerialConnection::new(ConnectionConfig::new("/dev/ttyUSB0"));
/// connection.on_connection_status(|open| println!("open: {open}"));
/// connection.on_data_incoming(|line| println!("received: {line}"));
/// connection.start()?;
/// # Ok::<(), serialio::Error>(())
/// ```
pub struct SerialConnection {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialConnection {
    /// A connection over the real serial stack.
    pub fn new(config: ConnectionConfig) -> Self {
        let transport = SerialTransport::new(config.port.clone(), config.settings.baud_rate)
            .with_timeout(config.settings.read_timeout);
        Self::with_transport(config, Box::new(transport), Arc::new(SystemPortEnumerator))
    }

    /// A connection over an injected transport and enumerator.
    ///
    /// The transport's port and baud rate are aligned with `config`; if the
    /// transport is already open it is left as is.
    pub fn with_transport(
        config: ConnectionConfig,
        mut transport: Box<dyn Transport>,
        enumerator: Arc<dyn PortEnumerator>,
    ) -> Self {
        if !transport.is_open() {
            let aligned = transport
                .set_port(config.port.clone())
                .and_then(|()| transport.set_baud_rate(config.settings.baud_rate));
            if let Err(e) = aligned {
                warn!(port = ?config.port, "could not apply config to transport: {e}");
            }
        }
        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                transport: Mutex::new(transport),
                enumerator,
                bus: EventBus::new(),
                signal: RunSignal::new(),
                snapshot: Mutex::new(ConnectionState::default()),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the poll loop.
    ///
    /// Fails with [`Error::AlreadyRunning`] or [`Error::Stopped`] if the
    /// connection is not idle.
    pub fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.shared.signal.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => return Err(Error::AlreadyRunning),
                Lifecycle::Stopped => return Err(Error::Stopped),
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
            }
        }

        let shared = self.shared.clone();
        let name = format!("serialio-{}", self.shared.label());
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.shared.signal.lifecycle.lock() = Lifecycle::Idle;
                Err(Error::Spawn(e))
            }
        }
    }

    /// Clear the running flag and close the transport.
    ///
    /// Returns immediately. The loop notices at the top of its next cycle, so
    /// an in-flight read may still complete; use [`join`](Self::join) to wait.
    pub fn stop(&self) {
        let port = self.shared.label();
        let previous = self.shared.signal.stop();
        if previous != Lifecycle::Stopped {
            info!(%port, "stopping");
        }
        // A busy transport means a read is in flight; the loop closes it on exit.
        if let Some(mut transport) = self.shared.transport.try_lock() {
            if transport.is_open() {
                if let Err(e) = transport.close() {
                    warn!(%port, "close failed: {e}");
                }
            }
        }
        if previous != Lifecycle::Running {
            self.shared.snapshot.lock().is_running = false;
        }
    }

    /// Wait for the loop thread to exit. Returns at once if it never started.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(port = %self.shared.label(), "poll loop thread panicked");
            }
        }
    }

    /// Run a single poll cycle on the calling thread.
    ///
    /// Only allowed while idle, so it never races the loop thread.
    pub fn poll_once(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Running => return Err(Error::AlreadyRunning),
            Lifecycle::Stopped => return Err(Error::Stopped),
            Lifecycle::Idle => {}
        }
        let mut state = self.shared.snapshot.lock().clone();
        self.shared.poll_cycle(&mut state);
        Ok(())
    }

    /// Send `message` followed by `line_ending`.
    ///
    /// Does nothing if the port is closed or the message is empty. Transport
    /// errors are logged, not returned.
    pub fn write(&self, message: &str, line_ending: &str) {
        if message.is_empty() {
            return;
        }
        let port = self.shared.label();
        let mut transport = self.shared.transport.lock();
        if !transport.is_open() {
            debug!(%port, "write skipped, port closed");
            return;
        }
        let payload = format!("{message}{line_ending}");
        match transport.write_bytes(payload.as_bytes()) {
            Ok(n) => debug!(%port, bytes = n, "wrote"),
            Err(e) => warn!(%port, "write failed: {e}"),
        }
    }

    /// Forget the port and close it. The loop stops trying to reconnect.
    pub fn disconnect(&self) {
        let mut config = self.shared.config.write();
        if config.port.is_none() {
            return;
        }
        let mut transport = self.shared.transport.lock();
        if let Err(e) = transport.close() {
            warn!(port = ?config.port, "close failed: {e}");
        }
        if let Err(e) = transport.set_port(None) {
            warn!(port = ?config.port, "clearing port failed: {e}");
        }
        info!(port = ?config.port, "disconnected");
        config.port = None;
    }

    /// Replace the whole config, closing the transport first.
    ///
    /// The loop reopens with the new settings on its next cycle.
    pub fn reconfigure(&self, new_config: ConnectionConfig) -> Result<()> {
        let mut config = self.shared.config.write();
        let mut transport = self.shared.transport.lock();
        transport.close()?;
        transport.set_port(new_config.port.clone())?;
        transport.set_baud_rate(new_config.settings.baud_rate)?;
        info!(from = ?config.port, to = ?new_config.port, "reconfigured");
        *config = new_config;
        Ok(())
    }

    /// Point the connection at `port`, keeping every other setting.
    pub fn attach(&self, port: impl Into<String>) -> Result<()> {
        let mut config = self.config();
        config.port = Some(port.into());
        self.reconfigure(config)
    }

    /// Ports currently present on the host.
    pub fn list_ports(&self) -> std::result::Result<Vec<String>, PortError> {
        self.shared.enumerator.list_ports()
    }

    /// Register a callback for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, callback)
    }

    /// Remove a subscription made with any `on*` method.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.bus.off(id)
    }

    pub fn on_connection_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on(EventKind::ConnectionStatus, move |event| {
            if let ConnectionEvent::ConnectionStatus(open) = event {
                callback(*open);
            }
        })
    }

    pub fn on_data_incoming<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on(EventKind::DataIncoming, move |event| {
            if let ConnectionEvent::DataIncoming(line) = event {
                callback(line);
            }
        })
    }

    pub fn on_ports_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.on(EventKind::PortsUpdate, move |event| {
            if let ConnectionEvent::PortsUpdate(ports) = event {
                callback(ports);
            }
        })
    }

    /// Current configured port, if any.
    pub fn port(&self) -> Option<String> {
        self.shared.config.read().port.clone()
    }

    /// Current config.
    pub fn config(&self) -> ConnectionConfig {
        self.shared.config.read().clone()
    }

    /// Whether the transport is open right now.
    ///
    /// Blocks while a read is in flight.
    pub fn is_open(&self) -> bool {
        self.shared.transport.lock().is_open()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.signal.get()
    }

    /// The loop's bookkeeping as of its last completed cycle.
    pub fn state(&self) -> ConnectionState {
        self.shared.snapshot.lock().clone()
    }

    /// Subscribe `forward` to every event kind.
    ///
    /// Events emitted after `stop()` by a cycle still in flight are not
    /// forwarded.
    pub(crate) fn forward_to<F>(&self, forward: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let forward = Arc::new(forward);
        for kind in EventKind::ALL {
            let forward = forward.clone();
            let shared = Arc::downgrade(&self.shared);
            self.shared.bus.on(kind, move |event: &ConnectionEvent| {
                let stopped = shared
                    .upgrade()
                    .map_or(true, |shared| shared.signal.get() == Lifecycle::Stopped);
                if !stopped {
                    forward(event);
                }
            });
        }
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("port", &self.port())
            .field("lifecycle", &self.lifecycle())
            .field("bus", &self.shared.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusEvent;
    use crate::port::{MockEnumerator, MockTransport};
    use pretty_assertions::assert_eq;

    fn quick(port: &str) -> ConnectionConfig {
        ConnectionConfig::new(port)
            .with_reconnect_delay(Duration::ZERO)
            .with_port_refresh_interval(Duration::ZERO)
    }

    fn connection(config: ConnectionConfig) -> (SerialConnection, MockTransport, MockEnumerator) {
        let transport = MockTransport::new("placeholder");
        transport.set_idle_read_delay(Duration::ZERO);
        let enumerator = MockEnumerator::default();
        let conn = SerialConnection::with_transport(
            config,
            Box::new(transport.clone()),
            Arc::new(enumerator.clone()),
        );
        (conn, transport, enumerator)
    }

    fn record(conn: &SerialConnection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = log.clone();
            conn.on(kind, move |event| sink.lock().push(event.clone()));
        }
        log
    }

    #[test]
    fn test_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(1));
        assert_eq!(settings.max_read_attempts, 10);
        assert_eq!(settings.port_refresh_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_applied_to_transport() {
        let (conn, transport, _) = connection(quick("COM7").with_baud_rate(115_200));
        assert_eq!(transport.port().as_deref(), Some("COM7"));
        assert_eq!(transport.baud_rate(), 115_200);
        assert_eq!(conn.port().as_deref(), Some("COM7"));
    }

    #[test]
    fn test_first_cycle_opens_then_status_precedes_data() {
        let (conn, transport, _) = connection(quick("COM1"));
        let log = record(&conn);
        transport.enqueue_line(b"buffered\r\n");

        conn.poll_once().unwrap();
        assert!(transport.is_open());
        assert!(log.lock().is_empty());

        conn.poll_once().unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                ConnectionEvent::ConnectionStatus(true),
                ConnectionEvent::DataIncoming("buffered".into()),
            ]
        );
    }

    #[test]
    fn test_status_fires_once_per_transition() {
        let (conn, transport, _) = connection(quick("COM1"));
        let log = record(&conn);
        transport.force_open();

        for _ in 0..3 {
            conn.poll_once().unwrap();
        }
        transport.set_present(false);
        conn.reconfigure(quick("COM1")).unwrap();
        for _ in 0..3 {
            conn.poll_once().unwrap();
        }

        assert_eq!(
            *log.lock(),
            vec![
                ConnectionEvent::ConnectionStatus(true),
                ConnectionEvent::ConnectionStatus(false),
            ]
        );
    }

    #[test]
    fn test_empty_lines_are_ignored() {
        let (conn, transport, _) = connection(quick("COM1"));
        let log = record(&conn);
        transport.force_open();
        transport.enqueue_line(b"\r\n");
        transport.enqueue_line(b"   \n");

        for _ in 0..3 {
            conn.poll_once().unwrap();
        }

        assert_eq!(*log.lock(), vec![ConnectionEvent::ConnectionStatus(true)]);
        assert_eq!(conn.state().failed_read_attempts, 0);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let (conn, transport, _) = connection(quick("COM1"));
        let log = record(&conn);
        transport.force_open();
        transport.enqueue_line(b"ok\xff\n");

        conn.poll_once().unwrap();

        assert_eq!(
            log.lock().last(),
            Some(&ConnectionEvent::DataIncoming("ok\u{fffd}".into()))
        );
    }

    #[test]
    fn test_read_failures_force_close() {
        let (conn, transport, _) = connection(quick("COM1").with_max_read_attempts(3));
        transport.force_open();
        transport.set_read_failure(Some("io".into()));

        conn.poll_once().unwrap();
        conn.poll_once().unwrap();
        assert_eq!(conn.state().failed_read_attempts, 2);
        assert!(transport.is_open());

        conn.poll_once().unwrap();
        assert_eq!(conn.state().failed_read_attempts, 0);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_zero_max_attempts_closes_on_first_failure() {
        let (conn, transport, _) = connection(quick("COM1").with_max_read_attempts(0));
        transport.force_open();
        transport.enqueue_failure("io");

        conn.poll_once().unwrap();
        assert!(!transport.is_open());
    }

    #[test]
    fn test_successful_read_does_not_reset_counter() {
        let (conn, transport, _) = connection(quick("COM1").with_max_read_attempts(5));
        transport.force_open();
        transport.enqueue_failure("io");
        transport.enqueue_line(b"fine\n");

        conn.poll_once().unwrap();
        conn.poll_once().unwrap();
        assert_eq!(conn.state().failed_read_attempts, 1);
    }

    #[test]
    fn test_no_port_skips_reconnect() {
        let settings = ConnectionSettings {
            reconnect_delay: Duration::ZERO,
            port_refresh_interval: Duration::ZERO,
            ..Default::default()
        };
        let (conn, transport, _) = connection(ConnectionConfig::detached(&settings));

        conn.poll_once().unwrap();
        assert!(transport.open_attempts().is_empty());
    }

    #[test]
    fn test_ports_update_only_on_change() {
        let (conn, _, enumerator) = connection(
            quick("COM1").with_port_refresh_interval(Duration::from_nanos(1)),
        );
        let log = record(&conn);
        enumerator.set_ports(["COM1", "COM2"]);

        conn.poll_once().unwrap();
        conn.poll_once().unwrap();
        enumerator.set_ports(["COM2", "COM1"]);
        conn.poll_once().unwrap();

        let updates: Vec<_> = log
            .lock()
            .iter()
            .filter(|e| e.kind() == EventKind::PortsUpdate)
            .cloned()
            .collect();
        assert_eq!(
            updates,
            vec![
                ConnectionEvent::PortsUpdate(vec!["COM1".into(), "COM2".into()]),
                ConnectionEvent::PortsUpdate(vec!["COM2".into(), "COM1".into()]),
            ]
        );
        assert_eq!(enumerator.scan_count(), 3);
    }

    proptest::proptest! {
        #[test]
        fn prop_ports_update_count_matches_changes(
            scans in proptest::collection::vec(
                proptest::collection::vec("COM[1-3]", 0..3),
                1..8,
            )
        ) {
            let settings = ConnectionSettings {
                reconnect_delay: Duration::ZERO,
                port_refresh_interval: Duration::from_nanos(1),
                ..ConnectionSettings::default()
            };
            let (conn, _, enumerator) = connection(ConnectionConfig::detached(&settings));
            let log = record(&conn);

            let mut previous: Vec<String> = Vec::new();
            let mut expected = 0;
            for ports in &scans {
                if *ports != previous {
                    expected += 1;
                    previous = ports.clone();
                }
                enumerator.set_ports(ports.clone());
                conn.poll_once().unwrap();
            }

            proptest::prop_assert_eq!(log.lock().len(), expected);
            proptest::prop_assert_eq!(&conn.state().last_known_ports, &previous);
        }
    }

    #[test]
    fn test_zero_refresh_never_scans() {
        let (conn, _, enumerator) = connection(quick("COM1"));
        for _ in 0..5 {
            conn.poll_once().unwrap();
        }
        assert_eq!(enumerator.scan_count(), 0);
    }

    #[test]
    fn test_scan_waits_for_interval() {
        let (conn, _, enumerator) = connection(
            quick("COM1").with_port_refresh_interval(Duration::from_secs(3600)),
        );
        conn.poll_once().unwrap();
        assert_eq!(enumerator.scan_count(), 0);
        assert!(conn.state().elapsed_since_last_scan > Duration::ZERO);
    }

    #[test]
    fn test_write_appends_line_ending() {
        let (conn, transport, _) = connection(quick("COM1"));
        transport.force_open();

        conn.write("G28", "\r\n");
        conn.write("", "\n");

        assert_eq!(transport.write_log(), vec![b"G28\r\n".to_vec()]);
    }

    #[test]
    fn test_write_when_closed_is_noop() {
        let (conn, transport, _) = connection(quick("COM1"));
        conn.write("hello", "\n");
        assert!(transport.write_log().is_empty());
    }

    #[test]
    fn test_write_error_is_swallowed() {
        let (conn, transport, _) = connection(quick("COM1"));
        transport.force_open();
        transport.set_fail_writes(true);
        conn.write("hello", "\n");
        assert!(transport.write_log().is_empty());
    }

    #[test]
    fn test_disconnect_clears_port() {
        let (conn, transport, _) = connection(quick("COM1"));
        transport.force_open();

        conn.disconnect();

        assert!(!transport.is_open());
        assert_eq!(conn.port(), None);
        assert_eq!(transport.port(), None);

        conn.poll_once().unwrap();
        assert!(transport.open_attempts().is_empty());
    }

    #[test]
    fn test_reconfigure_and_attach() {
        let (conn, transport, _) = connection(quick("COM1"));
        transport.force_open();

        conn.reconfigure(quick("COM2").with_baud_rate(57_600)).unwrap();
        assert!(!transport.is_open());
        assert_eq!(transport.port().as_deref(), Some("COM2"));
        assert_eq!(transport.baud_rate(), 57_600);

        conn.attach("COM3").unwrap();
        assert_eq!(conn.port().as_deref(), Some("COM3"));
        assert_eq!(conn.config().settings.baud_rate, 57_600);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (conn, _, _) = connection(quick("COM1"));
        assert_eq!(conn.lifecycle(), Lifecycle::Idle);

        conn.start().unwrap();
        assert!(conn.is_running());
        assert!(matches!(conn.start(), Err(Error::AlreadyRunning)));
        assert!(matches!(conn.poll_once(), Err(Error::AlreadyRunning)));

        conn.stop();
        conn.join();
        assert_eq!(conn.lifecycle(), Lifecycle::Stopped);
        assert!(!conn.state().is_running);
        assert!(matches!(conn.start(), Err(Error::Stopped)));
    }

    #[test]
    fn test_stop_wakes_reconnect_wait() {
        let (conn, transport, _) = connection(
            quick("COM1").with_reconnect_delay(Duration::from_secs(60)),
        );
        transport.set_present(false);
        conn.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        conn.stop();
        conn.join();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unbounded_reconnect_delay_waits_for_stop() {
        let settings = ConnectionSettings {
            reconnect_delay: Duration::MAX,
            port_refresh_interval: Duration::ZERO,
            ..ConnectionSettings::default()
        };
        let (conn, _, _) = connection(ConnectionConfig::detached(&settings));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                conn.stop();
            });
            conn.poll_once().unwrap();
        });

        assert_eq!(conn.lifecycle(), Lifecycle::Stopped);
        assert!(!conn.state().is_running);
    }

    #[test]
    fn test_no_scan_after_stop_interrupts_wait() {
        let (conn, _, enumerator) = connection(
            ConnectionConfig::detached(&ConnectionSettings::default())
                .with_reconnect_delay(Duration::from_secs(3600))
                .with_port_refresh_interval(Duration::from_nanos(1)),
        );
        enumerator.set_ports(["COM1"]);
        let log = record(&conn);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                conn.stop();
            });
            conn.poll_once().unwrap();
        });

        assert_eq!(enumerator.scan_count(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_forwarding_ends_at_stop() {
        let (conn, _, _) = connection(quick("COM1"));
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        conn.forward_to(move |event| sink.lock().push(event.clone()));

        conn.shared.bus.emit(&ConnectionEvent::DataIncoming("live".into()));
        conn.stop();
        conn.shared.bus.emit(&ConnectionEvent::DataIncoming("late".into()));

        assert_eq!(
            *forwarded.lock(),
            vec![ConnectionEvent::DataIncoming("live".into())]
        );
    }

    #[test]
    fn test_run_signal_sleep() {
        let signal = RunSignal::new();
        assert!(signal.sleep(Duration::from_millis(1)));
        assert_eq!(signal.stop(), Lifecycle::Idle);
        assert!(!signal.sleep(Duration::from_secs(60)));
        assert!(!signal.sleep(Duration::MAX));
    }
}
