//! One configured server and its transport
//!
//! The endpoint tracks what is in flight on its transport by nonce and
//! keeps the latency estimate the sink's placement heuristic runs on.
//! Status transitions are driven by the sink; the endpoint only records
//! them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_protocol::Nonce;
use courier_transport::{
    AddressPool, Backoff, Transport, TransportError, TransportMetrics, TransportMetricsSnapshot,
};
use serde::Serialize;
use tokio::time::Instant;

use crate::payload::{Payload, PayloadKey};

/// Completed payloads the latency average spans
const LATENCY_WINDOW: f64 = 5.0;

/// Share of the latency kept when an endpoint is passed over
const LATENCY_DECAY: f64 = 0.99;

/// Endpoint state, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Waiting for the transport to connect, or for the recovery backoff
    Idle,
    Active,
    /// At the pending payload limit
    Full,
    Failed,
    Closing,
    Closed,
}

impl EndpointStatus {
    /// Connected or connecting and not shutting down
    #[inline]
    pub fn is_alive(self) -> bool {
        self < Self::Failed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Full => "full",
            Self::Failed => "failed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct InFlight {
    key: PayloadKey,
    lines: usize,
    acked: usize,
    sent_at: Instant,
}

/// Result of an acknowledgement for a known nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub key: PayloadKey,
    /// Events newly acknowledged; zero for a repeated sequence
    pub lines: usize,
    pub complete: bool,
}

pub struct Endpoint {
    server: String,
    pool: Arc<AddressPool>,
    transport: Box<dyn Transport>,
    metrics: Arc<TransportMetrics>,
    finish_on_fail: bool,
    status: EndpointStatus,
    pending: HashMap<Nonce, InFlight>,
    pending_lines: usize,
    line_count: u64,
    /// Seconds per event
    average_latency: f64,
    est_del_time: Instant,
    warming: bool,
    pinging: bool,
    backoff: Backoff,
    fatal: bool,
    last_error: Option<String>,
}

impl Endpoint {
    pub(crate) fn new(
        server: String,
        pool: Arc<AddressPool>,
        transport: Box<dyn Transport>,
        metrics: Arc<TransportMetrics>,
        finish_on_fail: bool,
        backoff: Backoff,
    ) -> Self {
        Self {
            server,
            pool,
            transport,
            metrics,
            finish_on_fail,
            status: EndpointStatus::Idle,
            pending: HashMap::new(),
            pending_lines: 0,
            line_count: 0,
            average_latency: 0.0,
            est_del_time: Instant::now(),
            warming: false,
            pinging: false,
            backoff,
            fatal: false,
            last_error: None,
        }
    }

    #[inline]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[inline]
    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    #[inline]
    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: EndpointStatus) {
        self.status = status;
    }

    /// Payloads in flight
    #[inline]
    pub fn num_payloads(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Events acknowledged through this endpoint
    #[inline]
    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    #[inline]
    pub fn average_latency(&self) -> Duration {
        Duration::from_secs_f64(self.average_latency)
    }

    #[inline]
    pub fn est_del_time(&self) -> Instant {
        self.est_del_time
    }

    #[inline]
    pub fn is_warming(&self) -> bool {
        self.warming
    }

    #[inline]
    pub fn is_pinging(&self) -> bool {
        self.pinging
    }

    #[inline]
    pub fn finish_on_fail(&self) -> bool {
        self.finish_on_fail
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub(crate) fn set_fatal(&mut self) {
        self.fatal = true;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Estimated time a payload of `lines` events queued now would complete
    pub fn candidate_del_time(&self, lines: usize) -> Instant {
        self.est_del_time + Duration::from_secs_f64(self.average_latency * lines as f64)
    }

    /// Let a passed-over endpoint drift back into contention
    pub fn reduce_latency(&mut self) {
        self.average_latency *= LATENCY_DECAY;
    }

    /// Hand the payload's unacknowledged tail to the transport
    ///
    /// Nothing is recorded unless the transport accepts the write.
    pub(crate) fn queue_payload(&mut self, payload: &mut Payload) -> Result<(), TransportError> {
        if self.status != EndpointStatus::Active {
            return Err(TransportError::Closed);
        }

        let mut nonce = Nonce::random();
        while self.pending.contains_key(&nonce) {
            nonce = Nonce::random();
        }
        let transmission = payload.transmission(nonce);
        let lines = transmission.len();
        self.transport.write(transmission)?;

        let now = Instant::now();
        self.pending.insert(
            nonce,
            InFlight {
                key: payload.key(),
                lines,
                acked: 0,
                sent_at: now,
            },
        );
        self.pending_lines += lines;
        if self.average_latency == 0.0 {
            self.warming = true;
        }
        self.update_est_del_time(now);
        Ok(())
    }

    pub(crate) fn send_ping(&mut self) -> Result<(), TransportError> {
        self.pinging = true;
        self.transport.ping()
    }

    pub(crate) fn process_pong(&mut self) {
        self.pinging = false;
    }

    /// Apply an acknowledgement; `None` for an unknown nonce
    pub(crate) fn process_ack(&mut self, nonce: Nonce, sequence: u32) -> Option<AckOutcome> {
        let now = Instant::now();
        let inflight = self.pending.get_mut(&nonce)?;

        let sequence = (sequence as usize).min(inflight.lines);
        let lines = sequence.saturating_sub(inflight.acked);
        inflight.acked += lines;
        let key = inflight.key;
        let complete = inflight.acked == inflight.lines;

        self.pending_lines -= lines;
        self.line_count += lines as u64;
        self.pinging = false;

        if complete {
            if let Some(done) = self.pending.remove(&nonce) {
                let sample = now.duration_since(done.sent_at).as_secs_f64() / done.lines.max(1) as f64;
                self.average_latency = if self.average_latency == 0.0 {
                    sample
                } else {
                    let keep = (-1.0 / LATENCY_WINDOW).exp();
                    self.average_latency * keep + sample * (1.0 - keep)
                };
            }
            self.warming = false;
            self.backoff.reset();
        }
        self.update_est_del_time(now);

        Some(AckOutcome {
            key,
            lines,
            complete,
        })
    }

    /// Take back every payload in flight
    pub(crate) fn pull_back_pending(&mut self) -> Vec<PayloadKey> {
        let keys = self.pending.drain().map(|(_, inflight)| inflight.key).collect();
        self.pending_lines = 0;
        self.est_del_time = Instant::now();
        keys
    }

    /// Record a failure; the latency estimate starts over
    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = EndpointStatus::Failed;
        self.average_latency = 0.0;
        self.warming = false;
        self.pinging = false;
        self.last_error = Some(error);
    }

    /// Wait before the next recovery attempt
    pub(crate) fn next_backoff(&mut self) -> Duration {
        self.backoff.trigger()
    }

    pub(crate) fn fail_transport(&mut self) {
        self.transport.fail();
    }

    pub(crate) fn shutdown_transport(&mut self) {
        self.transport.shutdown();
    }

    fn update_est_del_time(&mut self, now: Instant) {
        self.est_del_time = now + Duration::from_secs_f64(self.average_latency * self.pending_lines as f64);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("server", &self.server)
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "endpoint_test.rs"]
mod endpoint_test;
