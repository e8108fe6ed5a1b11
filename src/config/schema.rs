//! Configuration schema definitions.
//!
//! Every section has serde defaults, so a partial file (or none at all) is a
//! valid configuration.

use super::error::{ConfigError, ConfigResult};
use crate::connection::{
    ConnectionSettings, DEFAULT_BAUD_RATE, DEFAULT_MAX_READ_ATTEMPTS,
    DEFAULT_PORT_REFRESH_INTERVAL, DEFAULT_READ_TIMEOUT, DEFAULT_RECONNECT_DELAY,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ports to manage
    pub devices: Vec<String>,
    /// Transport parameters
    pub serial: SerialConfig,
    /// Reconnect and polling policy
    pub connection: ConnectionSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::invalid("serial.baud_rate", "must be non-zero"));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "serial.read_timeout_ms",
                "must be non-zero",
            ));
        }
        self.reconnect_delay()?;
        self.port_refresh_interval()?;
        if let Some(index) = self.devices.iter().position(|d| d.trim().is_empty()) {
            return Err(ConfigError::invalid(
                format!("devices[{index}]"),
                "port name is empty",
            ));
        }
        Ok(())
    }

    /// Validate and convert into the settings a connection runs with.
    pub fn connection_settings(&self) -> ConfigResult<ConnectionSettings> {
        self.validate()?;
        Ok(ConnectionSettings {
            baud_rate: self.serial.baud_rate,
            reconnect_delay: self.reconnect_delay()?,
            max_read_attempts: self.connection.max_read_attempts,
            port_refresh_interval: self.port_refresh_interval()?,
            read_timeout: self.serial.read_timeout(),
        })
    }

    fn reconnect_delay(&self) -> ConfigResult<Duration> {
        seconds(
            "connection.reconnect_delay_secs",
            self.connection.reconnect_delay_secs,
        )
    }

    fn port_refresh_interval(&self) -> ConfigResult<Duration> {
        seconds("connection.port_refresh_secs", self.connection.port_refresh_secs)
    }
}

fn seconds(key: &str, value: f64) -> ConfigResult<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            key,
            format!("expected a finite number of seconds >= 0, got {value}"),
        ));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConfigError::invalid(key, format!("{value} seconds: {e}")))
}

/// Serial transport section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate for every managed port
    pub baud_rate: u32,
    /// Upper bound on one blocking read, in milliseconds
    pub read_timeout_ms: u64,
    /// Appended to every written message
    pub line_ending: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            line_ending: "\n".to_string(),
        }
    }
}

impl SerialConfig {
    /// Get the read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Reconnect and polling section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Seconds between reconnect attempts
    pub reconnect_delay_secs: f64,
    /// Read failures tolerated before the port is closed
    pub max_read_attempts: u32,
    /// Seconds between port scans, 0 to disable
    pub port_refresh_secs: f64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY.as_secs_f64(),
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
            port_refresh_secs: DEFAULT_PORT_REFRESH_INTERVAL.as_secs_f64(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
    /// Compact format
    #[default]
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.devices.is_empty());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.connection.max_read_attempts, 10);
        assert_eq!(config.logging.format, LogFormat::Compact);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_settings_match_connection_defaults() {
        let settings = Config::default().connection_settings().unwrap();
        assert_eq!(settings, ConnectionSettings::default());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[serial]"));
        assert!(toml_str.contains("[connection]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            devices = ["/dev/ttyUSB0", "/dev/ttyACM0"]

            [connection]
            reconnect_delay_secs = 0.25
            port_refresh_secs = 0

            [serial]
            baud_rate = 115200
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.devices, vec!["/dev/ttyUSB0", "/dev/ttyACM0"]);
        assert_eq!(config.serial.baud_rate, 115200);
        // Defaults should still work
        assert_eq!(config.serial.line_ending, "\n");

        let settings = config.connection_settings().unwrap();
        assert_eq!(settings.reconnect_delay, Duration::from_millis(250));
        assert!(settings.port_refresh_interval.is_zero());
    }

    #[test]
    fn test_validation_rejects_negative_delay() {
        let mut config = Config::default();
        config.connection.reconnect_delay_secs = -1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_delay_secs"));
    }

    #[test]
    fn test_validation_rejects_nan_refresh() {
        let mut config = Config::default();
        config.connection.port_refresh_secs = f64::NAN;
        assert!(config.connection_settings().is_err());
    }

    #[test]
    fn test_validation_rejects_unrepresentable_delay() {
        let mut config = Config::default();
        config.connection.reconnect_delay_secs = 1e20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "connection.reconnect_delay_secs"
        ));
        assert!(config.connection_settings().is_err());

        config.connection.reconnect_delay_secs = 1.0;
        config.connection.port_refresh_secs = f64::MAX;
        assert!(matches!(
            config.connection_settings(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "connection.port_refresh_secs"
        ));
    }

    #[test]
    fn test_validation_rejects_blank_device() {
        let mut config = Config::default();
        config.devices = vec!["COM1".into(), " ".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("devices[1]"));
    }

    #[test]
    fn test_validation_rejects_zero_baud() {
        let mut config = Config::default();
        config.serial.baud_rate = 0;
        assert!(config.validate().is_err());
    }
}
