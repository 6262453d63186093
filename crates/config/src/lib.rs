//! Courier Configuration
//!
//! TOML-based configuration loading with sensible defaults. Only the
//! sections a command needs must be present: `courier publish` requires
//! `[network]`, `courier receive` uses `[receiver]`.
//!
//! # Parsing
//!
//! ```
//! use courier_config::Config;
//! use std::str::FromStr;
//!
//! let config = Config::from_str("[network]\nservers = [\"localhost:5043\"]").unwrap();
//! assert_eq!(config.network.unwrap().servers.len(), 1);
//! ```
//!
//! # Example Config
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [network]
//! servers = ["log-a.example.com:5043", "log-b.example.com:5043"]
//! method = "loadbalance"
//! transport = "tls"
//!
//! [network.tls]
//! ssl_ca = ["/etc/courier/ca.pem"]
//! ```

mod error;
mod logging;
mod network;
mod receiver;
mod streamload;
mod tls;
mod validation;

use std::fs;
use std::path::Path;
use std::str::FromStr;

pub use error::{ConfigError, Result};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use network::{Method, NetworkConfig, TransportKind};
pub use receiver::ReceiverConfig;
pub use streamload::{Scheme, StreamLoadConfig};
pub use tls::{TlsConfig, TlsVersion};
pub use validation::{validate_network, validate_receiver};

use serde::Deserialize;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,

    /// Publisher network settings
    pub network: Option<NetworkConfig>,

    /// Receiver settings
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, contains invalid TOML,
    /// or fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        validation::validate_config(&config)?;
        Ok(config)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
