//! Stream-load transport configuration
//!
//! Used when `network.transport = "streamload"`. Servers are the HTTP
//! frontends; schema work goes over the MySQL protocol to
//! `metadata_servers`.

use std::collections::BTreeMap;

use serde::Deserialize;

/// HTTP scheme for stream-load requests
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Stream-load configuration
///
/// ```toml
/// [network.streamload]
/// database = "logs"
/// table_pattern = "app_%{service}_%{+%Y%m}"
/// columns = ["host", "level"]
/// metadata_servers = ["fe-1.example.com:9030"]
/// retention_days = 30
///
/// [network.streamload.additional_columns]
/// level = "VARCHAR(16)"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamLoadConfig {
    /// Target database
    /// Required for the stream-load transport
    pub database: String,

    /// Static table name
    pub table: Option<String>,

    /// Per-event table name pattern (`%{field.path}`, `%{+strftime}`)
    pub table_pattern: Option<String>,

    /// Event fields promoted to top-level columns
    pub columns: Vec<String>,

    /// JSON column receiving every field not listed in `columns`
    /// Default: "rest"
    pub rest_column: String,

    /// Prefix for stream-load labels
    /// Default: "courier"
    pub label_prefix: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Concurrent load workers per endpoint (1-32)
    /// Default: 4
    pub routines: usize,

    /// `host:port` of MySQL-protocol frontends used for schema management
    pub metadata_servers: Vec<String>,

    /// Days of partitions to keep, 0 keeps everything
    /// Default: 0
    pub retention_days: u32,

    /// Column types for entries of `columns`, `STRING` when absent
    pub additional_columns: BTreeMap<String, String>,

    /// Extra stream-load headers sent with every request
    pub properties: BTreeMap<String, String>,

    /// Default: http
    pub scheme: Scheme,
}

impl Default for StreamLoadConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            table: None,
            table_pattern: None,
            columns: Vec::new(),
            rest_column: "rest".to_string(),
            label_prefix: "courier".to_string(),
            username: None,
            password: None,
            routines: 4,
            metadata_servers: Vec::new(),
            retention_days: 0,
            additional_columns: BTreeMap::new(),
            properties: BTreeMap::new(),
            scheme: Scheme::Http,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamLoadConfig::default();
        assert_eq!(config.routines, 4);
        assert_eq!(config.rest_column, "rest");
        assert_eq!(config.scheme, Scheme::Http);
        assert!(config.table.is_none());
    }

    #[test]
    fn test_deserialize() {
        let toml = r#"
database = "logs"
table = "events"
columns = ["host"]
username = "loader"
password = "secret"
scheme = "https"

[properties]
max_filter_ratio = "0.1"
"#;
        let config: StreamLoadConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database, "logs");
        assert_eq!(config.table.as_deref(), Some("events"));
        assert_eq!(config.columns, vec!["host".to_string()]);
        assert_eq!(config.scheme, Scheme::Https);
        assert_eq!(
            config.properties.get("max_filter_ratio").map(String::as_str),
            Some("0.1")
        );
    }
}
