//! Courier protocol transport
//!
//! Client side: one long-lived connection per endpoint, optionally over
//! TLS, with a handshake that decides between streamed `EVNT` and legacy
//! `JDAT` payload frames. The receiver module implements the server side
//! with partial-ack keepalives.
//!
//! # Connection lifecycle (client)
//!
//! ```text
//! dial -> TLS handshake -> HELO/VERS -> Started -> send + receive loops
//!   ^                                                  |
//!   +------------- backoff <------ Failed <------------+
//! ```

mod client;
mod receiver;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use courier_config::{NetworkConfig, TransportKind};
use rustls::ClientConfig;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

pub use client::CourierTransport;
pub use receiver::{Acker, CourierReceiver, ReceivedPayload};

use crate::tls::{self, TlsError};
use crate::transport::{Transport, TransportContext, TransportFactory};

/// Interval between server keepalive acks for in-flight payloads
pub const PARTIAL_ACK_INTERVAL: Duration = Duration::from_secs(5);

/// In-flight payloads a receiver connection accepts before it stops reading
pub const MAX_IN_FLIGHT: usize = 10;

/// TLS settings for the client
#[derive(Clone)]
pub(crate) struct ClientTls {
    pub config: Arc<ClientConfig>,
    pub server_name: Option<String>,
}

/// Settings shared by all courier client transports of one factory
#[derive(Clone)]
pub(crate) struct CourierSettings {
    pub timeout: Duration,
    pub queue_size: usize,
    pub backoff_floor: Duration,
    pub backoff_max: Duration,
    pub tls: Option<ClientTls>,
}

/// Creates courier client transports
pub struct CourierFactory {
    settings: Arc<CourierSettings>,
}

impl CourierFactory {
    /// Build a factory from the network section
    ///
    /// TLS material is loaded once here, so a bad certificate is reported
    /// at startup or reload rather than on every connection.
    pub fn new(network: &NetworkConfig) -> Result<Self, TlsError> {
        let tls = match network.transport {
            TransportKind::Tls => Some(ClientTls {
                config: tls::client_config(&network.tls)?,
                server_name: network.tls.server_name.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            settings: Arc::new(CourierSettings {
                timeout: network.timeout,
                queue_size: network.max_pending_payloads.max(1),
                backoff_floor: network.failure_backoff,
                backoff_max: network.failure_backoff_max,
                tls,
            }),
        })
    }
}

impl TransportFactory for CourierFactory {
    fn new_transport(&self, context: TransportContext) -> Box<dyn Transport> {
        Box::new(CourierTransport::spawn(context, Arc::clone(&self.settings)))
    }

    fn name(&self) -> &'static str {
        if self.settings.tls.is_some() {
            "tls"
        } else {
            "tcp"
        }
    }
}

/// Disable Nagle and enable TCP keepalive; failures are not fatal
pub(crate) fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_interval(Duration::from_secs(10));

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to set TCP keep-alive");
    }
}

#[cfg(test)]
#[path = "courier_test.rs"]
mod courier_test;
