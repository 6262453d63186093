//! Publisher error types

use courier_config::ConfigError;
use courier_transport::{StreamLoadError, TlsError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PublisherError>;

/// Errors raised while building or reconfiguring a publisher
///
/// Delivery problems never surface here: they are handled by failing the
/// endpoint and resending.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("invalid network configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to set up tls transport: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to set up streamload transport: {0}")]
    StreamLoad(#[from] StreamLoadError),
}
