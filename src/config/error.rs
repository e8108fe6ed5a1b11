//! Errors raised while loading, validating or saving configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration failure. Every variant names the file, key or variable at
/// fault.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot encode configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Cannot write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value is out of range, e.g. a negative reconnect delay.
    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },

    /// A `SERIALIO_*` override could not be parsed.
    #[error("Invalid environment override '{var}': {message}")]
    Env { var: String, message: String },

    #[error("Missing configuration: {0}")]
    Missing(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn env(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Env {
            var: var.into(),
            message: message.into(),
        }
    }

    /// The offending key or variable, if the error is about a single value.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Invalid { key, .. } => Some(key),
            Self::Env { var, .. } => Some(var),
            _ => None,
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
