//! Application and server configuration.
//!
//! Configuration is plain data deserialized with `serde` from TOML. Every
//! section is `#[serde(default)]`, so an empty file is a valid configuration:
//!
//! ```toml
//! [app]
//! name = "inventory"
//! debug = true
//!
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//! max_payload_size = 1048576
//! maintenance = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on request bodies (10 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Errors produced while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    /// Exposes panic messages and traces in error bodies.
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "trellis".to_owned(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Largest request body accepted, in bytes.
    pub max_payload_size: usize,
    /// Start with the maintenance router active.
    pub maintenance: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            maintenance: false,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for [`Server::bind`](crate::Server::bind).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, [`ConfigError::Parse`]
    /// for malformed TOML, [`ConfigError::Invalid`] when a value is out of range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.server.max_payload_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_payload_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(!config.app.debug);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml("[app]\ndebug = true\n[server]\nport = 3000\n").unwrap();
        assert!(config.app.debug);
        assert_eq!(config.app.name, "trellis");
        assert_eq!(config.server.address(), "127.0.0.1:3000");
    }

    #[test]
    fn zero_payload_size_is_rejected() {
        let err = Config::from_toml("[server]\nmax_payload_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml("[server\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
