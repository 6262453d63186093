//! Receiver configuration for `courier receive`

use std::path::PathBuf;

use serde::Deserialize;

use crate::tls::TlsVersion;

/// Courier receiver (server side) configuration
///
/// ```toml
/// [receiver]
/// listen = "0.0.0.0:5043"
/// tls = true
/// ssl_certificate = "/etc/courier/server.pem"
/// ssl_key = "/etc/courier/server.key"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Listen address
    /// Default: 0.0.0.0:5043
    pub listen: String,

    /// Require TLS on accepted connections
    /// Default: false
    pub tls: bool,

    pub ssl_certificate: Option<PathBuf>,

    pub ssl_key: Option<PathBuf>,

    /// CA files used to verify client certificates
    pub ssl_client_ca: Vec<PathBuf>,

    /// Reject clients without a certificate signed by `ssl_client_ca`
    /// Default: false
    pub verify_peer: bool,

    /// Default: 1.2
    pub min_tls_version: TlsVersion,

    /// Default: 1.3
    pub max_tls_version: TlsVersion,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5043".to_string(),
            tls: false,
            ssl_certificate: None,
            ssl_key: None,
            ssl_client_ca: Vec::new(),
            verify_peer: false,
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
        }
    }
}
