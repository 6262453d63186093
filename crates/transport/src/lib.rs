//! Courier Transport - delivery to one endpoint at a time
//!
//! A transport owns the connection to one endpoint and is driven by the
//! publisher loop through the non-blocking [`Transport`] trait. Results come
//! back as [`TransportEvent`]s on a channel shared by all endpoints.
//!
//! # Transports
//!
//! - [`CourierFactory`] - courier protocol over TCP or TLS, with windowed
//!   acknowledgements and keepalive pings
//! - [`StreamLoadFactory`] - HTTP stream-load into an analytic database,
//!   with schema management over the MySQL protocol
//!
//! The receiving side of the courier protocol is [`CourierReceiver`].
//!
//! Server names are resolved through an [`AddressPool`], which walks the
//! resolved addresses round-robin and supports `@name` SRV lookups.

mod backoff;
mod error;
mod metrics;
mod pool;
mod transport;

pub mod courier;
pub mod streamload;
pub mod test_utils;
pub mod tls;

pub use backoff::Backoff;
pub use courier::{Acker, CourierFactory, CourierReceiver, CourierTransport, ReceivedPayload};
pub use error::TransportError;
pub use metrics::{TransportMetrics, TransportMetricsSnapshot};
pub use pool::{Address, AddressPool, PoolError, Resolver, SrvTarget, SystemResolver};
pub use streamload::{StreamLoadError, StreamLoadFactory, StreamLoadTransport};
pub use tls::TlsError;
pub use transport::{
    EndpointId, EventChannel, EventSender, Transport, TransportContext, TransportEvent,
    TransportFactory, TransportPayload,
};
