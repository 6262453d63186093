//! TLS material loading
//!
//! Builds rustls client and server configurations from the courier
//! configuration. CA bundles are assembled by appending every certificate
//! found in each configured PEM file. TLS 1.2 is the lowest version
//! offered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use courier_config::{ReceiverConfig, TlsConfig, TlsVersion};
use rustls::crypto::{CryptoProvider, ring};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load {path}: {message}")]
    Pem { path: String, message: String },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no CA certificates configured (ssl_ca)")]
    NoTrustAnchors,

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("client verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

impl TlsError {
    fn pem(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Pem {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Protocol versions between `min` and `max` inclusive
pub fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions = Vec::with_capacity(2);
    if min <= TlsVersion::Tls13 && max >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    if min <= TlsVersion::Tls12 && max >= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    versions
}

/// Read every certificate in a PEM file
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| TlsError::pem(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::pem(path, e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::pem(path, e))
}

/// Trust store built from one or more CA bundles
pub fn root_store(paths: &[PathBuf]) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for path in paths {
        for cert in load_certificates(path)? {
            roots.add(cert)?;
        }
    }
    Ok(roots)
}

/// Client configuration for courier and stream-load connections
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>, TlsError> {
    if tls.ssl_ca.is_empty() {
        return Err(TlsError::NoTrustAnchors);
    }
    let roots = root_store(&tls.ssl_ca)?;

    let builder = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&protocol_versions(tls.min_tls_version, tls.max_tls_version))?
        .with_root_certificates(roots);

    let config = match (&tls.ssl_certificate, &tls.ssl_key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certificates(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Server configuration for the receiver
pub fn server_config(receiver: &ReceiverConfig) -> Result<Arc<ServerConfig>, TlsError> {
    let (Some(cert), Some(key)) = (&receiver.ssl_certificate, &receiver.ssl_key) else {
        return Err(TlsError::NoCertificates("receiver.ssl_certificate".to_string()));
    };

    let builder = ServerConfig::builder_with_provider(provider()).with_protocol_versions(
        &protocol_versions(receiver.min_tls_version, receiver.max_tls_version),
    )?;

    let builder = if receiver.ssl_client_ca.is_empty() {
        builder.with_no_client_auth()
    } else {
        let roots = Arc::new(root_store(&receiver.ssl_client_ca)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider());
        let verifier = if receiver.verify_peer {
            verifier
        } else {
            verifier.allow_unauthenticated()
        };
        let verifier = verifier
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    };

    let config = builder.with_single_cert(load_certificates(cert)?, load_private_key(key)?)?;
    Ok(Arc::new(config))
}

/// Name presented for SNI and checked against the server certificate
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

#[cfg(test)]
#[path = "tls_test.rs"]
mod tls_test;
