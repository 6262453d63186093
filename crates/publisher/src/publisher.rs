//! Publisher loop
//!
//! The publisher turns spooled batches into payloads, hands them to the
//! sink, and commits acknowledged progress to the registrar in submission
//! order. Everything runs on one task: the loop multiplexes transport
//! events, timers, spool batches, reloads, a stats tick and shutdown.
//!
//! # Payload lifecycle
//!
//! ```text
//! spool ──► next_spool ──► payloads ──► endpoint ──► ack ──► registrar
//!                             ▲            │
//!                             └── resend ◄─┘ (failure)
//! ```
//!
//! A payload stays in the payload map until every event is acknowledged
//! and committed. Commits only ever come from the head of the map, so an
//! out-of-order completion waits for everything submitted before it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use courier_config::{NetworkConfig, TransportKind, validate_network};
use courier_protocol::Event;
use courier_transport::{
    CourierFactory, EndpointId, Resolver, StreamLoadFactory, SystemResolver, TransportEvent,
    TransportFactory,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::endpoint::{AckOutcome, Endpoint, EndpointStatus};
use crate::error::Result;
use crate::method::{self, MethodPolicy};
use crate::payload::{Payload, PayloadKey};
use crate::registrar::{Commit, LogRegistrar, Registrar};
use crate::sink::{EndpointSink, PlacementError, SinkObserver, Timeout, TimerAction};
use crate::speed::SpeedEstimator;
use crate::status::{PublisherStatus, StatusHandle};

/// Capacity of the transport event channel
const EVENT_CHANNEL_SIZE: usize = 1024;

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Builds the transport factory for a configuration
pub type FactoryBuilder =
    Box<dyn Fn(&NetworkConfig) -> Result<Arc<dyn TransportFactory>> + Send + Sync>;

/// Factory for the configured transport kind
pub fn default_factory(config: &NetworkConfig) -> Result<Arc<dyn TransportFactory>> {
    Ok(match config.transport {
        TransportKind::Tls | TransportKind::Tcp => Arc::new(CourierFactory::new(config)?),
        TransportKind::Streamload => Arc::new(StreamLoadFactory::new(config)?),
    })
}

/// Builder for [`Publisher`]
pub struct PublisherBuilder {
    config: NetworkConfig,
    registrar: Option<Box<dyn Registrar>>,
    factory: Option<FactoryBuilder>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl PublisherBuilder {
    /// Where commits go; defaults to a registrar that only logs
    pub fn registrar(mut self, registrar: impl Registrar + 'static) -> Self {
        self.registrar = Some(Box::new(registrar));
        self
    }

    /// Use `factory` for every transport, whatever the configuration says
    pub fn factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(Box::new(move |_| Ok(Arc::clone(&factory))));
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate the configuration and set up the transport factory
    ///
    /// No connection is made until [`Publisher::run`].
    pub fn build(self) -> Result<Publisher> {
        validate_network(&self.config)?;

        let factories = self.factory.unwrap_or_else(|| Box::new(default_factory));
        let factory = factories(&self.config)?;
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver::new()));
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let method = method::for_method(self.config.method);
        let sink = EndpointSink::new(self.config, factory, resolver, tx);

        Ok(Publisher {
            sink,
            state: PublisherState {
                method,
                registrar: self
                    .registrar
                    .unwrap_or_else(|| Box::new(LogRegistrar::default())),
                payloads: BTreeMap::new(),
                resend: VecDeque::new(),
                next_spool: None,
                next_key: 1,
                out_of_sync: 0,
                published_lines: 0,
            },
            events,
            factories,
            status: StatusHandle::default(),
            speed: SpeedEstimator::new(),
        })
    }
}

/// Ordered, at-least-once delivery of spooled batches to the configured
/// servers
pub struct Publisher {
    sink: EndpointSink,
    state: PublisherState,
    events: mpsc::Receiver<(EndpointId, TransportEvent)>,
    factories: FactoryBuilder,
    status: StatusHandle,
    speed: SpeedEstimator,
}

impl Publisher {
    pub fn builder(config: NetworkConfig) -> PublisherBuilder {
        PublisherBuilder {
            config,
            registrar: None,
            factory: None,
            resolver: None,
        }
    }

    /// Handle to the status refreshed every second while running
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Run until `shutdown` is cancelled, or the spool closes and every
    /// accepted event has been committed
    ///
    /// A configuration received on `reload` replaces the current one if it
    /// validates; otherwise it is logged and ignored.
    pub async fn run(
        mut self,
        mut spool: mpsc::Receiver<Vec<Event>>,
        mut reload: mpsc::Receiver<NetworkConfig>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            method = self.state.method.name(),
            transport = self.sink.config().transport.as_str(),
            servers = ?self.sink.config().servers,
            "publisher starting"
        );
        self.state.method.reload(&mut self.sink);

        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();
        let mut spool_open = true;
        let mut reload_open = true;

        loop {
            if self.sink.is_shutting_down() && self.sink.count() == 0 {
                break;
            }
            if !spool_open && !self.sink.is_shutting_down() && self.state.is_drained() {
                tracing::info!("spool closed and all events committed, shutting down");
                self.sink.shutdown();
                continue;
            }

            let accepting = spool_open && !self.sink.is_shutting_down() && self.state.can_accept();
            let next_due = self.sink.next_due();

            tokio::select! {
                biased;

                _ = shutdown.cancelled(), if !self.sink.is_shutting_down() => {
                    tracing::info!(
                        pending_payloads = self.state.payloads.len(),
                        "shutdown requested, closing endpoints"
                    );
                    self.sink.shutdown();
                }

                Some((id, event)) = self.events.recv() => {
                    self.sink.process_event(id, event, &mut self.state);
                }

                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.sink.process_timers(Instant::now(), &mut self.state);
                }

                batch = spool.recv(), if accepting => match batch {
                    Some(events) => self.state.accept(events),
                    None => {
                        tracing::info!(
                            pending_payloads = self.state.payloads.len(),
                            "spool closed, draining"
                        );
                        spool_open = false;
                    }
                },

                config = reload.recv(), if reload_open => match config {
                    Some(config) => self.reload(config),
                    None => reload_open = false,
                },

                _ = stats.tick() => {
                    let now = Instant::now();
                    self.update_status(now.duration_since(last_stats));
                    last_stats = now;
                }
            }

            self.state.fill(&mut self.sink);
        }

        self.update_status(Instant::now().duration_since(last_stats));
        tracing::info!(
            published_lines = self.state.published_lines,
            "publisher stopped"
        );
    }

    fn reload(&mut self, config: NetworkConfig) {
        if let Err(e) = validate_network(&config) {
            tracing::error!(error = %e, "invalid network configuration, keeping the current one");
            return;
        }

        let factory = if self.sink.config().transport_changed(&config) {
            match (self.factories)(&config) {
                Ok(factory) => Some(factory),
                Err(e) => {
                    tracing::error!(error = %e, "failed to set up transport, keeping the current configuration");
                    return;
                }
            }
        } else {
            None
        };
        let method_changed = self.sink.config().method != config.method;
        let method = config.method;

        self.sink.reload_config(config);
        if let Some(factory) = factory {
            self.sink.replace_factory(factory);
        }
        if method_changed {
            tracing::info!(method = method.as_str(), "method changed, restarting endpoints");
            self.state.method = method::for_method(method);
            self.sink.restart();
        }
        self.state.method.reload(&mut self.sink);

        tracing::info!(
            servers = ?self.sink.config().servers,
            method = self.state.method.name(),
            "network configuration reloaded"
        );
    }

    fn update_status(&mut self, elapsed: Duration) {
        let speed = self.speed.update(self.state.published_lines, elapsed);
        let status = PublisherStatus {
            speed,
            published_lines: self.state.published_lines,
            pending_payloads: self.state.payloads.len(),
            max_pending_payloads: self.sink.config().max_pending_payloads,
            out_of_sync: self.state.out_of_sync,
            endpoints: self.sink.snapshot(),
        };
        tracing::trace!(
            speed = status.speed,
            pending_payloads = status.pending_payloads,
            out_of_sync = status.out_of_sync,
            "publisher stats"
        );
        self.status.set(status);
    }
}

/// Everything the publisher tracks besides the sink
struct PublisherState {
    method: Box<dyn MethodPolicy>,
    registrar: Box<dyn Registrar>,
    /// Accepted payloads in submission order
    payloads: BTreeMap<PayloadKey, Payload>,
    /// Payloads waiting for an endpoint, oldest first
    resend: VecDeque<PayloadKey>,
    /// A batch received while no endpoint could take it
    next_spool: Option<Vec<Event>>,
    next_key: PayloadKey,
    /// Payloads acknowledged ahead of the head
    out_of_sync: usize,
    published_lines: u64,
}

impl PublisherState {
    /// Whether the loop should read another batch
    fn can_accept(&self) -> bool {
        self.next_spool.is_none() && self.resend.is_empty()
    }

    fn is_drained(&self) -> bool {
        self.next_spool.is_none() && self.payloads.is_empty()
    }

    fn accept(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        tracing::trace!(events = events.len(), "batch received");
        self.next_spool = Some(events);
    }

    /// Send waiting payloads, resends first, while endpoints are ready
    fn fill(&mut self, sink: &mut EndpointSink) {
        while sink.can_queue() {
            if let Some(&key) = self.resend.front() {
                if !self.payloads.contains_key(&key) {
                    self.resend.pop_front();
                    continue;
                }
                if !self.place(sink, key) {
                    break;
                }
                self.resend.pop_front();
                if let Some(payload) = self.payloads.get_mut(&key) {
                    payload.set_resending(false);
                }
                continue;
            }

            let Some(events) = self.next_spool.take() else {
                break;
            };
            let key = self.next_key;
            self.next_key += 1;
            self.payloads.insert(key, Payload::new(key, events));
            if !self.place(sink, key) {
                if let Some(payload) = self.payloads.get_mut(&key) {
                    payload.set_resending(true);
                }
                self.resend.push_back(key);
                break;
            }
        }
    }

    /// Queue one payload; false when no endpoint can take it right now
    fn place(&mut self, sink: &mut EndpointSink, key: PayloadKey) -> bool {
        loop {
            let Some(payload) = self.payloads.get_mut(&key) else {
                return true;
            };
            match sink.queue_payload(payload) {
                Ok(id) => {
                    let pending_armed = matches!(sink.scheduled(id), Some((_, TimerAction::TimeoutPending)));
                    if !pending_armed {
                        let timeout = sink.config().timeout;
                        sink.schedule(id, timeout, TimerAction::TimeoutPending);
                    }
                    return true;
                }
                Err(PlacementError::NoReady) | Err(PlacementError::Congested) => return false,
                Err(PlacementError::Failed { id, error }) => {
                    sink.force_failure(id, format!("failed to queue payload: {error}"), self);
                }
            }
        }
    }

    /// Re-arm the pending or keepalive timer of a working endpoint
    ///
    /// Recovering and closing endpoints keep their recovery or watchdog timer.
    fn schedule_idle_timer(&self, sink: &mut EndpointSink, id: EndpointId) {
        let working = |e: &&Endpoint| matches!(e.status(), EndpointStatus::Active | EndpointStatus::Full);
        let Some(endpoint) = sink.endpoint(id).filter(working) else {
            return;
        };
        let config = sink.config();
        let (after, action) = if endpoint.has_pending() {
            (config.timeout, TimerAction::TimeoutPending)
        } else {
            (config.keepalive_timeout, TimerAction::TimeoutKeepalive)
        };
        sink.schedule(id, after, action);
    }

    /// Commit everything contiguous from the head
    fn commit_head(&mut self) {
        while let Some(mut entry) = self.payloads.first_entry() {
            let payload = entry.get_mut();
            if payload.has_ack() {
                self.registrar.commit(Commit {
                    payload: payload.key(),
                    rollup: payload.rollup(),
                });
            }
            if !payload.is_complete() {
                break;
            }
            entry.remove();
            // An acknowledged payload reaching the head was counted when its
            // first ack arrived ahead of it
            if self.payloads.first_key_value().is_some_and(|(_, p)| p.ack_sequence() > 0) {
                self.out_of_sync = self.out_of_sync.saturating_sub(1);
            }
        }
        self.registrar.flush();
    }
}

impl SinkObserver for PublisherState {
    fn on_started(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        self.method.on_started(sink, id);
        if self.method.is_priority(sink, id) {
            self.fill(sink);
        }
        if sink.endpoint(id).is_some_and(|e| !e.has_pending()) {
            self.schedule_idle_timer(sink, id);
        }
    }

    fn on_ready(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        if self.method.is_priority(sink, id) {
            self.fill(sink);
        }
    }

    fn on_ack(&mut self, sink: &mut EndpointSink, id: EndpointId, ack: AckOutcome) {
        self.schedule_idle_timer(sink, id);

        let Some(payload) = self.payloads.get_mut(&ack.key) else {
            return;
        };
        let first_ack = payload.acknowledge(ack.lines);
        self.published_lines += ack.lines as u64;

        if payload.is_complete() && payload.is_resending() {
            payload.set_resending(false);
            self.resend.retain(|&k| k != ack.key);
        }

        if self.payloads.keys().next() != Some(&ack.key) {
            if first_ack {
                self.out_of_sync += 1;
            }
            return;
        }
        self.commit_head();
    }

    fn on_pong(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        self.schedule_idle_timer(sink, id);
    }

    fn on_fail(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        let mut keys = sink.pull_back_pending(id);
        if !keys.is_empty() {
            keys.sort_unstable();
            tracing::info!(payloads = keys.len(), "requeueing payloads from failed endpoint");
        }
        for key in keys {
            let Some(payload) = self.payloads.get_mut(&key) else {
                continue;
            };
            if payload.is_resending() {
                continue;
            }
            payload.set_resending(true);
            let at = self.resend.partition_point(|&k| k < key);
            self.resend.insert(at, key);
        }

        if sink.endpoint(id).is_some_and(|e| e.status() == EndpointStatus::Failed) {
            self.method.on_fail(sink, id);
        }
    }

    fn on_finish(&mut self, sink: &mut EndpointSink, server: &str, _previous: Option<EndpointId>) -> bool {
        self.method.on_finish(sink, server)
    }

    fn on_timeout(&mut self, sink: &mut EndpointSink, id: EndpointId, timeout: Timeout) {
        let Some(endpoint) = sink.endpoint(id) else {
            return;
        };
        match timeout {
            Timeout::Pending => {
                let reason = if endpoint.is_pinging() {
                    "no response to keepalive"
                } else {
                    "no response within timeout"
                };
                tracing::error!(endpoint = %endpoint.server(), "{reason}");
                sink.force_failure(id, reason.to_string(), self);
            }
            Timeout::Keepalive => {
                let timeout = sink.config().timeout;
                sink.schedule(id, timeout, TimerAction::TimeoutPending);
                match sink.send_ping(id) {
                    Ok(()) => {}
                    Err(e) if e.is_congestion() => {
                        tracing::debug!(error = %e, "ping deferred, transport busy");
                    }
                    Err(e) => sink.force_failure(id, format!("failed to send ping: {e}"), self),
                }
            }
        }
    }

    fn on_method_timer(&mut self, sink: &mut EndpointSink) {
        self.method.on_timer(sink);
    }
}

#[cfg(test)]
mod tests {
    use courier_transport::test_utils::MockTransportFactory;

    use super::*;
    use crate::error::PublisherError;

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = Publisher::builder(NetworkConfig::default())
            .factory(Arc::new(MockTransportFactory::new()))
            .build();
        assert!(matches!(result, Err(PublisherError::Config(_))));
    }

    #[tokio::test]
    async fn test_state_accepts_one_batch_at_a_time() {
        let publisher = Publisher::builder(NetworkConfig {
            servers: vec!["s1:5043".into()],
            ..NetworkConfig::default()
        })
        .factory(Arc::new(MockTransportFactory::new()))
        .build()
        .unwrap();

        let mut state = publisher.state;
        assert!(state.can_accept());
        state.accept(Vec::new());
        assert!(state.can_accept());
        state.accept(vec![Event::builder("a").build()]);
        assert!(!state.can_accept());
        assert!(!state.is_drained());
    }
}
