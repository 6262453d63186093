//! Configuration validation
//!
//! Validates config consistency:
//! - At least one server, no duplicates, every specifier well formed
//! - Timeouts and backoff bounds make sense
//! - TLS material comes in complete pairs
//! - Stream-load settings are complete when that transport is selected

use std::collections::HashSet;

use crate::error::{ConfigError, Result};
use crate::network::{NetworkConfig, TransportKind};
use crate::receiver::ReceiverConfig;
use crate::streamload::StreamLoadConfig;
use crate::tls::TlsConfig;
use crate::Config;

/// Columns every stream-load table carries
const RESERVED_COLUMNS: &[&str] = &["timestamp", "message", "source", "offset"];

/// Maximum stream-load worker count
const MAX_ROUTINES: usize = 32;

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if let Some(network) = &config.network {
        validate_network(network)?;
    }
    if let Some(receiver) = &config.receiver {
        validate_receiver(receiver)?;
    }
    Ok(())
}

/// Validate the `[network]` section
pub fn validate_network(network: &NetworkConfig) -> Result<()> {
    if network.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    let mut seen = HashSet::new();
    for server in &network.servers {
        if !seen.insert(server.as_str()) {
            return Err(ConfigError::duplicate_server(server));
        }
        validate_server(server)?;
    }

    if network.max_pending_payloads == 0 {
        return Err(ConfigError::invalid_value(
            "network",
            "max_pending_payloads",
            "must be at least 1",
        ));
    }
    if network.timeout.is_zero() {
        return Err(ConfigError::invalid_value("network", "timeout", "must be positive"));
    }
    if network.keepalive_timeout.is_zero() {
        return Err(ConfigError::invalid_value(
            "network",
            "keepalive_timeout",
            "must be positive",
        ));
    }
    if network.failure_backoff > network.failure_backoff_max {
        return Err(ConfigError::invalid_value(
            "network",
            "failure_backoff",
            "must not exceed failure_backoff_max",
        ));
    }
    if network.rfc2782_srv && network.rfc2782_service.is_empty() {
        return Err(ConfigError::missing_field("network", "rfc2782_service"));
    }

    validate_tls(&network.tls)?;

    if network.transport == TransportKind::Streamload {
        validate_streamload(&network.streamload)?;
    }

    Ok(())
}

/// Check a server specifier: `@name`, `host:port` or `[v6]:port`
fn validate_server(server: &str) -> Result<()> {
    if let Some(name) = server.strip_prefix('@') {
        if name.is_empty() {
            return Err(ConfigError::invalid_value(
                "network",
                "servers",
                "SRV specifier '@' needs a name",
            ));
        }
        return Ok(());
    }

    let Some((host, port)) = server.rsplit_once(':') else {
        return Err(ConfigError::invalid_value(
            "network",
            "servers",
            format!("'{server}' must be host:port or @srv-name"),
        ));
    };

    let host_ok = if host.starts_with('[') {
        host.ends_with(']') && host.len() > 2
    } else {
        !host.is_empty() && !host.contains(':')
    };
    if !host_ok {
        return Err(ConfigError::invalid_value(
            "network",
            "servers",
            format!("'{server}' has an invalid host, IPv6 addresses need brackets"),
        ));
    }

    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(ConfigError::invalid_value(
            "network",
            "servers",
            format!("'{server}' has an invalid port"),
        )),
    }
}

fn validate_tls(tls: &TlsConfig) -> Result<()> {
    if tls.min_tls_version > tls.max_tls_version {
        return Err(ConfigError::invalid_value(
            "network.tls",
            "min_tls_version",
            "must not be above max_tls_version",
        ));
    }
    match (&tls.ssl_certificate, &tls.ssl_key) {
        (Some(_), None) => Err(ConfigError::missing_field("network.tls", "ssl_key")),
        (None, Some(_)) => Err(ConfigError::missing_field("network.tls", "ssl_certificate")),
        _ => Ok(()),
    }
}

fn validate_streamload(streamload: &StreamLoadConfig) -> Result<()> {
    if streamload.database.is_empty() {
        return Err(ConfigError::missing_field("network.streamload", "database"));
    }

    match (&streamload.table, &streamload.table_pattern) {
        (None, None) => {
            return Err(ConfigError::missing_field("network.streamload", "table"));
        }
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid_value(
                "network.streamload",
                "table",
                "set either table or table_pattern, not both",
            ));
        }
        _ => {}
    }

    if !(1..=MAX_ROUTINES).contains(&streamload.routines) {
        return Err(ConfigError::invalid_value(
            "network.streamload",
            "routines",
            format!("must be between 1 and {MAX_ROUTINES}"),
        ));
    }

    if streamload.rest_column.is_empty() {
        return Err(ConfigError::missing_field("network.streamload", "rest_column"));
    }

    for column in &streamload.columns {
        if RESERVED_COLUMNS.contains(&column.as_str()) || *column == streamload.rest_column {
            return Err(ConfigError::invalid_value(
                "network.streamload",
                "columns",
                format!("'{column}' is a built-in column"),
            ));
        }
    }

    for name in streamload.additional_columns.keys() {
        if !streamload.columns.contains(name) {
            return Err(ConfigError::invalid_value(
                "network.streamload",
                "additional_columns",
                format!("'{name}' is not listed in columns"),
            ));
        }
    }

    Ok(())
}

/// Validate the `[receiver]` section
pub fn validate_receiver(receiver: &ReceiverConfig) -> Result<()> {
    if !receiver.listen.contains(':') {
        return Err(ConfigError::invalid_value(
            "receiver",
            "listen",
            "must be host:port",
        ));
    }
    if receiver.min_tls_version > receiver.max_tls_version {
        return Err(ConfigError::invalid_value(
            "receiver",
            "min_tls_version",
            "must not be above max_tls_version",
        ));
    }
    if receiver.tls {
        if receiver.ssl_certificate.is_none() {
            return Err(ConfigError::missing_field("receiver", "ssl_certificate"));
        }
        if receiver.ssl_key.is_none() {
            return Err(ConfigError::missing_field("receiver", "ssl_key"));
        }
        if receiver.verify_peer && receiver.ssl_client_ca.is_empty() {
            return Err(ConfigError::missing_field("receiver", "ssl_client_ca"));
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "validation_test.rs"]
mod validation_test;
