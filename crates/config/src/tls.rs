//! TLS configuration shared by the courier client, the receiver and
//! the stream-load transport.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

/// Supported TLS protocol versions
///
/// SSLv3, TLS 1.0 and TLS 1.1 are refused when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TryFrom<String> for TlsVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1.2" | "tls1.2" | "tlsv1.2" => Ok(Self::Tls12),
            "1.3" | "tls1.3" | "tlsv1.3" => Ok(Self::Tls13),
            "ssl3" | "sslv3" | "1.0" | "tls1.0" | "1.1" | "tls1.1" => Err(format!(
                "TLS version '{value}' is no longer supported, minimum is 1.2"
            )),
            _ => Err(format!(
                "unknown TLS version '{value}', expected 1.2 or 1.3"
            )),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("1.2"),
            Self::Tls13 => f.write_str("1.3"),
        }
    }
}

/// TLS material and protocol bounds
///
/// ```toml
/// [network.tls]
/// ssl_ca = ["/etc/courier/ca.pem", "/etc/courier/ca-next.pem"]
/// ssl_certificate = "/etc/courier/client.pem"
/// ssl_key = "/etc/courier/client.key"
/// min_tls_version = "1.2"
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM files whose certificates are appended to the trust store
    pub ssl_ca: Vec<PathBuf>,

    /// Client certificate chain (PEM)
    pub ssl_certificate: Option<PathBuf>,

    /// Client private key (PEM)
    pub ssl_key: Option<PathBuf>,

    /// Default: 1.2
    pub min_tls_version: TlsVersion,

    /// Default: 1.3
    pub max_tls_version: TlsVersion,

    /// Name used for SNI and verification instead of the dialled host
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ssl_ca: Vec::new(),
            ssl_certificate: None,
            ssl_key: None,
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
            server_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_parse() {
        let config: TlsConfig =
            toml::from_str("min_tls_version = \"1.3\"\nmax_tls_version = \"TLSv1.3\"").unwrap();
        assert_eq!(config.min_tls_version, TlsVersion::Tls13);
        assert_eq!(config.max_tls_version, TlsVersion::Tls13);
    }

    #[test]
    fn test_legacy_versions_refused() {
        for version in ["ssl3", "1.0", "1.1"] {
            let toml = format!("min_tls_version = \"{version}\"");
            let err = toml::from_str::<TlsConfig>(&toml).unwrap_err();
            assert!(err.to_string().contains("no longer supported"), "{err}");
        }
    }

    #[test]
    fn test_version_ordering() {
        assert!(TlsVersion::Tls12 < TlsVersion::Tls13);
    }
}
