//! Test utilities: a scriptable transport and a static resolver
//!
//! The mock transport records what the publisher hands it and lets the
//! test play the remote side by emitting `Started`, acks and failures.
//! Everything a mock emits goes through one forwarding task per
//! transport, so events from the publisher's calls and from the test
//! arrive in the order they were produced.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use courier_protocol::Nonce;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::error::TransportError;
use crate::pool::{PoolError, Resolver, SrvTarget};
use crate::transport::{
    EndpointId, Transport, TransportContext, TransportEvent, TransportFactory, TransportPayload,
};

/// Shared view of one mock transport
#[derive(Clone)]
pub struct MockHandle {
    pub server: String,
    pub id: EndpointId,
    events: mpsc::UnboundedSender<TransportEvent>,
    writes: Arc<Mutex<Vec<TransportPayload>>>,
    pings: Arc<AtomicUsize>,
    congested: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
    failures_requested: Arc<AtomicUsize>,
}

impl MockHandle {
    /// Report the connection as established
    pub fn start(&self) {
        let _ = self.events.send(TransportEvent::Started);
    }

    /// Acknowledge the first `sequence` events of a payload
    pub fn ack(&self, nonce: Nonce, sequence: u32) {
        let _ = self.events.send(TransportEvent::Ack { nonce, sequence });
    }

    /// Acknowledge a written payload completely
    pub fn ack_all(&self, payload: &TransportPayload) {
        self.ack(payload.nonce, payload.len() as u32);
    }

    pub fn pong(&self) {
        let _ = self.events.send(TransportEvent::Pong);
    }

    /// Report a connection failure
    pub fn fail(&self, error: TransportError) {
        let _ = self.events.send(TransportEvent::failed(error));
    }

    /// Report an unrecoverable failure
    pub fn fail_fatal(&self, error: TransportError) {
        let _ = self.events.send(TransportEvent::Failed { error, fatal: true });
    }

    pub fn finish(&self) {
        let _ = self.events.send(TransportEvent::Finished);
    }

    /// Make further writes and pings return congestion
    pub fn set_congested(&self, congested: bool) {
        self.congested.store(congested, Ordering::SeqCst);
    }

    /// Payloads written so far, clearing the record
    pub fn take_writes(&self) -> Vec<TransportPayload> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn failures_requested(&self) -> usize {
        self.failures_requested.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    handle: MockHandle,
    finish_on_fail: bool,
}

impl Transport for MockTransport {
    fn write(&mut self, payload: TransportPayload) -> Result<(), TransportError> {
        if self.handle.congested.load(Ordering::SeqCst) {
            return Err(TransportError::Congestion);
        }
        self.handle.writes.lock().push(payload);
        Ok(())
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        if self.handle.congested.load(Ordering::SeqCst) {
            return Err(TransportError::Congestion);
        }
        self.handle.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fail(&mut self) {
        self.handle.failures_requested.fetch_add(1, Ordering::SeqCst);
        self.handle.fail(TransportError::Forced);
        if self.finish_on_fail {
            self.handle.finish();
        }
    }

    fn shutdown(&mut self) {
        self.handle.shut_down.store(true, Ordering::SeqCst);
        self.handle.finish();
    }
}

#[derive(Default)]
struct FactoryState {
    handles: Vec<MockHandle>,
    auto_start: HashSet<String>,
    auto_start_all: bool,
}

/// Factory producing [`MockHandle`]-backed transports
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<Mutex<FactoryState>>,
    created: Arc<Notify>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every new transport reports `Started` immediately
    #[must_use]
    pub fn auto_start(self) -> Self {
        self.state.lock().auto_start_all = true;
        self
    }

    /// Transports for `server` report `Started` immediately
    pub fn auto_start_server(&self, server: &str) {
        self.state.lock().auto_start.insert(server.to_string());
    }

    /// Every transport created so far, oldest first
    pub fn handles(&self) -> Vec<MockHandle> {
        self.state.lock().handles.clone()
    }

    /// Most recent transport for `server`
    pub fn latest(&self, server: &str) -> Option<MockHandle> {
        self.state
            .lock()
            .handles
            .iter()
            .rev()
            .find(|h| h.server == server)
            .cloned()
    }

    /// Number of transports ever created for `server`
    pub fn created(&self, server: &str) -> usize {
        self.state
            .lock()
            .handles
            .iter()
            .filter(|h| h.server == server)
            .count()
    }

    /// Wait until at least `count` transports exist for `server`
    pub async fn wait_created(&self, server: &str, count: usize) -> MockHandle {
        loop {
            let notified = self.created.notified();
            if self.created(server) >= count {
                if let Some(handle) = self.latest(server) {
                    return handle;
                }
            }
            notified.await;
        }
    }
}

impl TransportFactory for MockTransportFactory {
    fn new_transport(&self, context: TransportContext) -> Box<dyn Transport> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = context.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !events.send(event).await {
                    break;
                }
            }
        });

        let handle = MockHandle {
            server: context.server.clone(),
            id: context.events.id(),
            events: tx,
            writes: Arc::default(),
            pings: Arc::default(),
            congested: Arc::default(),
            shut_down: Arc::default(),
            failures_requested: Arc::default(),
        };

        let auto_start = {
            let mut state = self.state.lock();
            state.handles.push(handle.clone());
            state.auto_start_all || state.auto_start.contains(&context.server)
        };
        if auto_start {
            handle.start();
        }
        self.created.notify_waiters();

        Box::new(MockTransport {
            handle,
            finish_on_fail: context.finish_on_fail,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Resolver answering from fixed tables
#[derive(Default)]
pub struct StaticResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    srv: Mutex<HashMap<String, Vec<SrvTarget>>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(self, name: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        self.hosts.lock().insert(name.to_string(), ips);
        self
    }

    pub fn srv(self, name: &str, targets: Vec<SrvTarget>) -> Self {
        self.srv.lock().insert(name.to_string(), targets);
        self
    }

    /// Total lookups served, hits and misses
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, PoolError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .lock()
            .get(host)
            .cloned()
            .ok_or_else(|| PoolError::lookup(host, "no such host"))
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, PoolError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.srv
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::lookup(name, "no such record"))
    }
}
