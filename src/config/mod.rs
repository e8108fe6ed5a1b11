//! Configuration for serialio.
//!
//! TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIALIO_CONFIG` environment variable (explicit path)
//! 2. `./serialio.toml` (current directory)
//! 3. The platform config directory (`~/.config/serialio/serialio.toml` on
//!    Linux, `%APPDATA%\serialio\config\serialio.toml` on Windows)
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is `SERIALIO_<SECTION>_<KEY>`, e.g.
//! `SERIALIO_SERIAL_BAUD_RATE=115200` or
//! `SERIALIO_CONNECTION_RECONNECT_DELAY_SECS=0.5`. `SERIALIO_DEVICES` takes a
//! comma-separated list.
//!
//! # Example
//!
//! ```rust,ignore
//! use serialio::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let settings = loader.config().connection_settings()?;
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{Config, ConnectionSection, LogFormat, LoggingConfig, SerialConfig};
