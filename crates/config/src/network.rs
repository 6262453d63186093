//! Network (publisher) configuration
//!
//! The `[network]` section decides which servers the publisher talks to,
//! how payloads are distributed between them, and which transport carries
//! them.

use std::time::Duration;

use serde::Deserialize;

use crate::streamload::StreamLoadConfig;
use crate::tls::TlsConfig;

/// Endpoint selection method
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// One endpoint at a time, a random server, replaced when it fails
    #[default]
    Random,
    /// Every server connected, payloads spread by estimated delivery time
    Loadbalance,
    /// Servers tried in priority order, earlier ones preferred when back
    Failover,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Loadbalance => "loadbalance",
            Self::Failover => "failover",
        }
    }
}

/// Transport used to deliver payloads
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Courier protocol over TLS (default)
    #[default]
    Tls,
    /// Courier protocol over plain TCP
    Tcp,
    /// HTTP stream-load into an analytic database
    Streamload,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Tcp => "tcp",
            Self::Streamload => "streamload",
        }
    }
}

/// Network configuration
///
/// Keys accept the spaced spelling used by older configuration files
/// (`"failure backoff"`) as well as snake case.
///
/// ```toml
/// [network]
/// servers = ["log-a.example.com:5043", "@logs.example.com"]
/// method = "failover"
/// timeout = "15s"
/// transport = "tls"
///
/// [network.tls]
/// ssl_ca = ["/etc/courier/ca.pem"]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server specifiers: `host:port`, `[v6]:port`, or `@srv-name`
    pub servers: Vec<String>,

    /// Default: random
    pub method: Method,

    /// Maximum time a payload may go without acknowledgement progress
    /// Default: 15s
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Idle time before a ping is sent to an endpoint
    /// Default: 900s
    #[serde(with = "humantime_serde", alias = "keepalive timeout")]
    pub keepalive_timeout: Duration,

    /// Initial reconnect wait after a failure
    /// Default: 0s (retry immediately, then grow)
    #[serde(with = "humantime_serde", alias = "failure backoff")]
    pub failure_backoff: Duration,

    /// Reconnect wait ceiling
    /// Default: 300s
    #[serde(with = "humantime_serde", alias = "failure backoff max")]
    pub failure_backoff_max: Duration,

    /// Payloads an endpoint may hold in flight before it is considered full
    /// Default: 10
    #[serde(alias = "max pending payloads")]
    pub max_pending_payloads: usize,

    /// Time a transport is given to finish after shutdown before it is failed
    /// Default: 10s
    #[serde(with = "humantime_serde", alias = "shutdown timeout")]
    pub shutdown_timeout: Duration,

    /// Default: tls
    pub transport: TransportKind,

    /// Prefix `@name` lookups with `_<service>._tcp.`
    /// Default: true
    #[serde(alias = "rfc 2782 srv")]
    pub rfc2782_srv: bool,

    /// Default: courier
    #[serde(alias = "rfc 2782 service")]
    pub rfc2782_service: String,

    /// How long resolved addresses are reused before re-resolving
    /// Default: 60s
    #[serde(with = "humantime_serde", alias = "address ttl")]
    pub address_ttl: Duration,

    pub tls: TlsConfig,

    pub streamload: StreamLoadConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            method: Method::Random,
            timeout: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(900),
            failure_backoff: Duration::ZERO,
            failure_backoff_max: Duration::from_secs(300),
            max_pending_payloads: 10,
            shutdown_timeout: Duration::from_secs(10),
            transport: TransportKind::Tls,
            rfc2782_srv: true,
            rfc2782_service: "courier".to_string(),
            address_ttl: Duration::from_secs(60),
            tls: TlsConfig::default(),
            streamload: StreamLoadConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Whether a reload from `self` to `other` requires new transports
    ///
    /// Anything a running transport captured at construction counts:
    /// the transport kind, TLS material, stream-load settings, address
    /// resolution and the reconnect backoff.
    pub fn transport_changed(&self, other: &NetworkConfig) -> bool {
        self.transport != other.transport
            || self.tls != other.tls
            || self.streamload != other.streamload
            || self.rfc2782_srv != other.rfc2782_srv
            || self.rfc2782_service != other.rfc2782_service
            || self.address_ttl != other.address_ttl
            || self.failure_backoff != other.failure_backoff
            || self.failure_backoff_max != other.failure_backoff_max
            || self.max_pending_payloads != other.max_pending_payloads
    }

    /// Whether `server` is one of the configured servers
    pub fn has_server(&self, server: &str) -> bool {
        self.servers.iter().any(|s| s == server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.method, Method::Random);
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(900));
        assert_eq!(config.failure_backoff, Duration::ZERO);
        assert_eq!(config.failure_backoff_max, Duration::from_secs(300));
        assert_eq!(config.max_pending_payloads, 10);
        assert_eq!(config.transport, TransportKind::Tls);
        assert!(config.rfc2782_srv);
        assert_eq!(config.rfc2782_service, "courier");
    }

    #[test]
    fn test_spaced_aliases() {
        let toml = r#"
servers = ["a:1"]
"failure backoff" = "5s"
"failure backoff max" = "1m"
"max pending payloads" = 4
"rfc 2782 srv" = false
"rfc 2782 service" = "logs"
"#;
        let config: NetworkConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.failure_backoff, Duration::from_secs(5));
        assert_eq!(config.failure_backoff_max, Duration::from_secs(60));
        assert_eq!(config.max_pending_payloads, 4);
        assert!(!config.rfc2782_srv);
        assert_eq!(config.rfc2782_service, "logs");
    }

    #[test]
    fn test_transport_changed() {
        let base = NetworkConfig {
            servers: vec!["a:1".into()],
            ..Default::default()
        };

        let mut servers_only = base.clone();
        servers_only.servers.push("b:2".into());
        servers_only.method = Method::Failover;
        servers_only.timeout = Duration::from_secs(1);
        assert!(!base.transport_changed(&servers_only));

        let mut tcp = base.clone();
        tcp.transport = TransportKind::Tcp;
        assert!(base.transport_changed(&tcp));

        let mut tls = base.clone();
        tls.tls.server_name = Some("logs.internal".into());
        assert!(base.transport_changed(&tls));
    }
}
