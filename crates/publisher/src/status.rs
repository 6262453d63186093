//! Publisher status reporting
//!
//! The publisher loop refreshes a [`PublisherStatus`] once per stats tick;
//! readers take a clone through a [`StatusHandle`] without touching the
//! loop.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::endpoint::{Endpoint, EndpointStatus};

/// One endpoint as seen by status readers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSnapshot {
    pub server: String,
    pub status: EndpointStatus,
    pub pending_payloads: usize,
    pub line_count: u64,
    pub average_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub payloads_sent: u64,
    pub bytes_sent: u64,
    pub acks_received: u64,
    pub reconnects: u64,
}

impl EndpointSnapshot {
    pub(crate) fn from_endpoint(endpoint: &Endpoint) -> Self {
        let metrics = endpoint.metrics();
        Self {
            server: endpoint.server().to_string(),
            status: endpoint.status(),
            pending_payloads: endpoint.num_payloads(),
            line_count: endpoint.line_count(),
            average_latency_ms: endpoint.average_latency().as_secs_f64() * 1000.0,
            last_error: endpoint.last_error().map(str::to_string),
            payloads_sent: metrics.payloads_sent,
            bytes_sent: metrics.bytes_sent,
            acks_received: metrics.acks_received,
            reconnects: metrics.reconnects,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublisherStatus {
    /// Events per second, smoothed
    pub speed: f64,
    pub published_lines: u64,
    pub pending_payloads: usize,
    pub max_pending_payloads: usize,
    /// Payloads acknowledged while an earlier one is still outstanding
    pub out_of_sync: usize,
    pub endpoints: Vec<EndpointSnapshot>,
}

/// Cheap shared view of the latest [`PublisherStatus`]
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<RwLock<PublisherStatus>>);

impl StatusHandle {
    pub fn get(&self) -> PublisherStatus {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, status: PublisherStatus) {
        *self.0.write() = status;
    }
}
