//! Crate-level error type.
//!
//! Transport hiccups inside a running poll loop are logged and swallowed, so
//! this type only surfaces lifecycle misuse and failures of explicit,
//! caller-driven operations (reconfiguring a port, loading configuration).

use crate::config::ConfigError;
use crate::port::PortError;
use thiserror::Error;

/// A specialized `Result` type for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type.
#[derive(Debug, Error)]
pub enum Error {
    /// `start()` or `poll_once()` on a connection whose loop is running.
    #[error("Connection is already running")]
    AlreadyRunning,

    /// The connection was stopped; build a new one to run again.
    #[error("Connection has been stopped and cannot be restarted")]
    Stopped,

    /// The poll loop thread could not be spawned.
    #[error("Failed to spawn poll loop thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A transport operation failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
