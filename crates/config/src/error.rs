//! Configuration error types

use std::io;
use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the file
        path: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// No servers configured for the publisher
    #[error("network has no servers - at least one server must be configured")]
    NoServers,

    /// The same server appears more than once
    #[error("server '{server}' is listed more than once")]
    DuplicateServer {
        /// The repeated server entry
        server: String,
    },

    /// Validation error - required field missing
    #[error("{section} is missing required field '{field}'")]
    MissingField {
        /// Section name (e.g., "network", "network.streamload")
        section: &'static str,
        /// Missing field name
        field: &'static str,
    },

    /// Validation error - invalid value
    #[error("{section} has invalid {field}: {message}")]
    InvalidValue {
        /// Section name
        section: &'static str,
        /// Field name
        field: &'static str,
        /// Error message
        message: String,
    },
}

impl ConfigError {
    /// Create a DuplicateServer error
    pub fn duplicate_server(server: impl Into<String>) -> Self {
        Self::DuplicateServer {
            server: server.into(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(section: &'static str, field: &'static str) -> Self {
        Self::MissingField { section, field }
    }

    /// Create an InvalidValue error
    pub fn invalid_value(
        section: &'static str,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            section,
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_server_error() {
        let err = ConfigError::duplicate_server("log.example.com:5043");
        assert!(err.to_string().contains("log.example.com:5043"));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_field_error() {
        let err = ConfigError::missing_field("network.streamload", "database");
        assert!(err.to_string().contains("network.streamload"));
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigError::invalid_value("network", "method", "must be one of: random");
        assert!(err.to_string().contains("network has invalid method"));
    }

    #[test]
    fn test_no_servers() {
        assert!(ConfigError::NoServers.to_string().contains("no servers"));
    }
}
