//! Per-transport counters
//!
//! Owned by the endpoint and shared with its transport through the
//! context; the transport increments, status readers take snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub payloads_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub reconnects: AtomicU64,
}

impl TransportMetrics {
    pub const fn new() -> Self {
        Self {
            payloads_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Record a payload written to the wire
    #[inline]
    pub fn record_sent(&self, bytes: u64) {
        self.payloads_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ack(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        TransportMetricsSnapshot {
            payloads_sent: self.payloads_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TransportMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportMetricsSnapshot {
    pub payloads_sent: u64,
    pub bytes_sent: u64,
    pub acks_received: u64,
    pub reconnects: u64,
}
