//! HTTP stream-load transport
//!
//! Loads payloads into an analytic database through its HTTP stream-load
//! API. Each endpoint runs a controller and a set of load workers that
//! share one bounded payload queue:
//!
//! ```text
//! write() -> queue -> worker 1..N -> group by table -> ensure schema
//!                                  -> gzip NDJSON -> PUT _stream_load -> Ack
//! ```
//!
//! A failed load is retried with backoff by the worker that owns it; the
//! publisher's pending timeout decides when the endpoint as a whole has
//! failed. A schema that cannot be reconciled fails the endpoint for good.

mod body;
mod client;
mod error;
mod schema;
mod table;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use courier_config::{NetworkConfig, Scheme, StreamLoadConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub use body::{LoadResponse, encode_body, encode_row};
pub use client::{CLIENT_IDLE_TIMEOUT, ClientCache};
pub use error::{SchemaError, StreamLoadError};
pub use schema::{
    ColumnSpec, DEFAULT_METADATA_PORT, MySqlSchemaBackend, SchemaBackend, TableManager,
    expected_columns, types_match,
};
pub use table::{TablePattern, TableTarget, sanitize};
pub use worker::StreamLoadTransport;

use crate::tls;
use crate::transport::{Transport, TransportContext, TransportFactory};

/// Settings shared by every stream-load transport of one factory
pub(crate) struct StreamLoadSettings {
    pub config: StreamLoadConfig,
    pub target: TableTarget,
    pub properties: HeaderMap,
    pub queue_size: usize,
    pub backoff_floor: Duration,
    pub backoff_max: Duration,
    pub clients: ClientCache,
    pub schema: Arc<dyn SchemaBackend>,
}

/// Creates stream-load transports
pub struct StreamLoadFactory {
    settings: Arc<StreamLoadSettings>,
}

impl StreamLoadFactory {
    pub fn new(network: &NetworkConfig) -> Result<Self, StreamLoadError> {
        let config = network.streamload.clone();
        let schema: Arc<dyn SchemaBackend> = Arc::new(MySqlSchemaBackend::new(
            config.username.clone(),
            config.password.clone(),
        ));
        Self::with_schema_backend(network, schema)
    }

    /// Use `schema` instead of connecting to the metadata servers
    pub fn with_schema_backend(
        network: &NetworkConfig,
        schema: Arc<dyn SchemaBackend>,
    ) -> Result<Self, StreamLoadError> {
        let config = network.streamload.clone();

        let target = match (&config.table, &config.table_pattern) {
            (Some(table), _) => TableTarget::Static(table.clone()),
            (None, Some(pattern)) => TableTarget::Pattern(TablePattern::parse(pattern)?),
            (None, None) => return Err(StreamLoadError::pattern("", "no table or table_pattern")),
        };

        let mut properties = HeaderMap::new();
        for (key, value) in &config.properties {
            let name = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes())
                .map_err(|_| StreamLoadError::InvalidProperty(key.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| StreamLoadError::InvalidProperty(key.clone()))?;
            properties.insert(name, value);
        }

        let tls = match config.scheme {
            Scheme::Https if !network.tls.ssl_ca.is_empty() => Some(tls::client_config(&network.tls)?),
            _ => None,
        };

        Ok(Self {
            settings: Arc::new(StreamLoadSettings {
                clients: ClientCache::new(network.timeout, tls)?,
                config,
                target,
                properties,
                queue_size: network.max_pending_payloads.max(1),
                backoff_floor: network.failure_backoff,
                backoff_max: network.failure_backoff_max,
                schema,
            }),
        })
    }
}

impl TransportFactory for StreamLoadFactory {
    fn new_transport(&self, context: TransportContext) -> Box<dyn Transport> {
        Box::new(StreamLoadTransport::spawn(context, Arc::clone(&self.settings)))
    }

    fn name(&self) -> &'static str {
        "streamload"
    }
}
