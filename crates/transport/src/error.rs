//! Transport error types

use std::io;

use courier_protocol::ProtocolError;
use thiserror::Error;

use crate::pool::PoolError;
use crate::streamload::StreamLoadError;
use crate::tls::TlsError;

/// Errors raised by transports
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot take more work right now; try another endpoint
    #[error("transport is congested")]
    Congestion,

    /// The transport has shut down and accepts nothing further
    #[error("transport is closed")]
    Closed,

    /// Dialling an address failed
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Socket read or write failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Framing or decoding failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer sent a message that is not valid at this point
    #[error("unexpected {0} message")]
    Unexpected(&'static str),

    /// A step did not complete within its deadline
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    #[error("address resolution failed: {0}")]
    Pool(#[from] PoolError),

    #[error("stream load failed: {0}")]
    StreamLoad(#[from] StreamLoadError),

    /// The owner asked the transport to fail
    #[error("failure requested")]
    Forced,
}

impl TransportError {
    /// Create a connection error
    pub fn connect(address: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            address: address.into(),
            source,
        }
    }

    /// Whether this is the transient back-pressure signal
    #[inline]
    pub fn is_congestion(&self) -> bool {
        matches!(self, Self::Congestion)
    }
}
