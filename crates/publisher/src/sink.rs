//! Endpoint sink
//!
//! Owns every endpoint, their timers, and three intrusive lists threaded
//! through an arena of slots:
//!
//! - ordered: configuration order, primary first
//! - ready: endpoints accepting payloads, fewest in flight first
//! - failed: endpoints waiting to recover
//!
//! An endpoint is on the ordered list for its whole life and on at most
//! one of ready or failed. Moving between lists only rewrites links.
//!
//! The sink reports back through [`SinkObserver`]. Each callback receives
//! the sink again so the observer can queue, schedule or add endpoints
//! without holding a second reference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_config::NetworkConfig;
use courier_transport::{
    AddressPool, Backoff, EndpointId, EventChannel, EventSender, Resolver, TransportContext,
    TransportError, TransportEvent, TransportFactory, TransportMetrics,
};
use tokio::time::Instant;

use crate::endpoint::{AckOutcome, Endpoint, EndpointStatus};
use crate::payload::{Payload, PayloadKey};
use crate::scheduler::Scheduler;
use crate::status::EndpointSnapshot;

/// Owner of a scheduler slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Endpoint(EndpointId),
    /// The method policy's single timer
    Method,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    TimeoutPending,
    TimeoutKeepalive,
    /// Recovery backoff elapsed
    MarkActive,
    /// The transport did not finish after shutdown
    ShutdownWatchdog,
    MethodTimer,
}

/// Publisher timeouts delivered through [`SinkObserver::on_timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Pending,
    Keepalive,
}

/// Why a payload could not be placed
#[derive(Debug)]
pub enum PlacementError {
    NoReady,
    /// Every ready endpoint refused the payload for now
    Congested,
    /// The chosen endpoint's transport failed the write
    Failed { id: EndpointId, error: TransportError },
}

/// Callbacks from the sink to its owner
///
/// They run on the publisher loop, after the sink has finished updating
/// its own state for the event.
pub trait SinkObserver {
    /// The transport connected, or recovery finished
    fn on_started(&mut self, sink: &mut EndpointSink, id: EndpointId);

    /// A full endpoint dropped below the pending limit
    fn on_ready(&mut self, sink: &mut EndpointSink, id: EndpointId);

    fn on_ack(&mut self, sink: &mut EndpointSink, id: EndpointId, ack: AckOutcome);

    fn on_pong(&mut self, sink: &mut EndpointSink, id: EndpointId);

    /// The endpoint failed, or finished with payloads still in flight;
    /// the observer is expected to pull those back
    fn on_fail(&mut self, sink: &mut EndpointSink, id: EndpointId);

    /// A configured server's endpoint finished; return true to recreate it
    /// after `previous` in the ordered list
    fn on_finish(&mut self, sink: &mut EndpointSink, server: &str, previous: Option<EndpointId>) -> bool;

    fn on_timeout(&mut self, sink: &mut EndpointSink, id: EndpointId, timeout: Timeout);

    fn on_method_timer(&mut self, sink: &mut EndpointSink);
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateList {
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum Chain {
    Order,
    State,
}

struct Node {
    endpoint: Endpoint,
    order: Link,
    state: Link,
    list: Option<StateList>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

fn link_mut(slots: &mut [Slot], index: u32, chain: Chain) -> Option<&mut Link> {
    let node = slots.get_mut(index as usize)?.node.as_mut()?;
    Some(match chain {
        Chain::Order => &mut node.order,
        Chain::State => &mut node.state,
    })
}

fn link(slots: &[Slot], index: u32, chain: Chain) -> Option<Link> {
    let node = slots.get(index as usize)?.node.as_ref()?;
    Some(match chain {
        Chain::Order => node.order,
        Chain::State => node.state,
    })
}

#[inline]
fn next_in(slots: &[Slot], index: u32, chain: Chain) -> Option<u32> {
    link(slots, index, chain).and_then(|l| l.next)
}

/// Doubly linked list over slot indices
#[derive(Debug, Default)]
struct List {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl List {
    /// Insert `index` before `before`, or at the back
    fn insert_before(&mut self, slots: &mut [Slot], chain: Chain, index: u32, before: Option<u32>) {
        let prev = match before {
            Some(b) => link(slots, b, chain).and_then(|l| l.prev),
            None => self.tail,
        };
        if let Some(l) = link_mut(slots, index, chain) {
            *l = Link { prev, next: before };
        }
        match prev {
            Some(p) => {
                if let Some(l) = link_mut(slots, p, chain) {
                    l.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        match before {
            Some(b) => {
                if let Some(l) = link_mut(slots, b, chain) {
                    l.prev = Some(index);
                }
            }
            None => self.tail = Some(index),
        }
        self.len += 1;
    }

    /// Insert `index` after `after`, or at the front
    fn insert_after(&mut self, slots: &mut [Slot], chain: Chain, index: u32, after: Option<u32>) {
        let before = match after {
            Some(a) => link(slots, a, chain).and_then(|l| l.next),
            None => self.head,
        };
        self.insert_before(slots, chain, index, before);
    }

    fn remove(&mut self, slots: &mut [Slot], chain: Chain, index: u32) {
        let Some(Link { prev, next }) = link(slots, index, chain) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(l) = link_mut(slots, p, chain) {
                    l.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(l) = link_mut(slots, n, chain) {
                    l.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(l) = link_mut(slots, index, chain) {
            *l = Link::default();
        }
        self.len -= 1;
    }

    fn indices(&self, slots: &[Slot], chain: Chain) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            out.push(index);
            cursor = next_in(slots, index, chain);
        }
        out
    }
}

pub struct EndpointSink {
    slots: Vec<Slot>,
    free: Vec<u32>,
    servers: HashMap<String, EndpointId>,
    ordered: List,
    ready: List,
    failed: List,
    scheduler: Scheduler<TimerKey, TimerAction>,
    factory: Arc<dyn TransportFactory>,
    resolver: Arc<dyn Resolver>,
    events: EventChannel,
    config: NetworkConfig,
    shutting_down: bool,
}

impl EndpointSink {
    pub fn new(
        config: NetworkConfig,
        factory: Arc<dyn TransportFactory>,
        resolver: Arc<dyn Resolver>,
        events: EventChannel,
    ) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            servers: HashMap::new(),
            ordered: List::default(),
            ready: List::default(),
            failed: List::default(),
            scheduler: Scheduler::new(),
            factory,
            resolver,
            events,
            config,
            shutting_down: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Replace the configuration, shutting down endpoints for servers no
    /// longer listed
    pub fn reload_config(&mut self, config: NetworkConfig) {
        self.config = config;
        for id in self.ordered_ids() {
            let listed = self
                .endpoint(id)
                .is_some_and(|e| self.config.has_server(e.server()));
            if !listed {
                self.shutdown_endpoint(id);
            }
        }
        self.reapply_limit();
    }

    /// Use `factory` for new transports and restart every endpoint
    ///
    /// Endpoints for configured servers are recreated as they finish.
    pub fn replace_factory(&mut self, factory: Arc<dyn TransportFactory>) {
        tracing::info!(transport = factory.name(), "transport changed, restarting endpoints");
        self.factory = factory;
        self.restart();
    }

    /// Shut down every endpoint without stopping the sink
    pub fn restart(&mut self) {
        for id in self.ordered_ids() {
            self.shutdown_endpoint(id);
        }
    }

    /// Append an endpoint to the ordered list
    pub fn add_endpoint(&mut self, server: &str, finish_on_fail: bool) -> EndpointId {
        let last = self.ordered.tail.map(|index| self.id_at(index));
        self.add_endpoint_after(server, finish_on_fail, last)
    }

    /// Create an endpoint after `previous` in the ordered list, or first
    ///
    /// A server that already has an endpoint keeps it.
    pub fn add_endpoint_after(
        &mut self,
        server: &str,
        finish_on_fail: bool,
        previous: Option<EndpointId>,
    ) -> EndpointId {
        if let Some(&existing) = self.servers.get(server) {
            tracing::debug!(endpoint = %server, "endpoint already exists");
            return existing;
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let id = EndpointId {
            index,
            generation: self.slots[index as usize].generation,
        };

        let srv_service = self
            .config
            .rfc2782_srv
            .then(|| self.config.rfc2782_service.clone());
        let pool = Arc::new(AddressPool::new(
            server,
            srv_service,
            self.config.address_ttl,
            Arc::clone(&self.resolver),
        ));
        let metrics = Arc::new(TransportMetrics::new());
        let transport = self.factory.new_transport(TransportContext {
            server: server.to_string(),
            pool: Arc::clone(&pool),
            events: EventSender::new(id, self.events.clone()),
            metrics: Arc::clone(&metrics),
            finish_on_fail,
        });
        let endpoint = Endpoint::new(
            server.to_string(),
            pool,
            transport,
            metrics,
            finish_on_fail,
            Backoff::new(self.config.failure_backoff, self.config.failure_backoff_max),
        );

        self.slots[index as usize].node = Some(Node {
            endpoint,
            order: Link::default(),
            state: Link::default(),
            list: None,
        });
        let after = previous.and_then(|p| self.index_of(p));
        self.ordered.insert_after(&mut self.slots, Chain::Order, index, after);
        self.servers.insert(server.to_string(), id);

        tracing::info!(
            endpoint = %server,
            id = %id,
            transport = self.factory.name(),
            "endpoint added"
        );
        id
    }

    pub fn find_endpoint(&self, server: &str) -> Option<EndpointId> {
        self.servers.get(server).copied()
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.node(id).map(|n| &n.endpoint)
    }

    /// Move `id` after `previous` in the ordered list, or to the front
    pub fn move_endpoint_after(&mut self, id: EndpointId, previous: Option<EndpointId>) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let after = previous.and_then(|p| self.index_of(p));
        if after == Some(index) {
            return;
        }
        self.ordered.remove(&mut self.slots, Chain::Order, index);
        self.ordered.insert_after(&mut self.slots, Chain::Order, index, after);
    }

    /// First endpoint in configuration order
    pub fn front(&self) -> Option<EndpointId> {
        self.ordered.head.map(|index| self.id_at(index))
    }

    /// Endpoint after `id` in configuration order
    pub fn next(&self, id: EndpointId) -> Option<EndpointId> {
        let index = self.index_of(id)?;
        link(&self.slots, index, Chain::Order)?
            .next
            .map(|next| self.id_at(next))
    }

    pub fn previous(&self, id: EndpointId) -> Option<EndpointId> {
        let index = self.index_of(id)?;
        link(&self.slots, index, Chain::Order)?
            .prev
            .map(|prev| self.id_at(prev))
    }

    /// Endpoints in configuration order
    pub fn ordered_ids(&self) -> Vec<EndpointId> {
        self.ordered
            .indices(&self.slots, Chain::Order)
            .into_iter()
            .map(|index| self.id_at(index))
            .collect()
    }

    /// Ready endpoints, fewest in flight first
    pub fn ready_ids(&self) -> Vec<EndpointId> {
        self.ready
            .indices(&self.slots, Chain::State)
            .into_iter()
            .map(|index| self.id_at(index))
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.ordered.len
    }

    #[inline]
    pub fn has_ready(&self) -> bool {
        self.ready.len > 0
    }

    #[inline]
    pub fn can_queue(&self) -> bool {
        !self.shutting_down && self.has_ready()
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Close every endpoint; nothing is recreated afterwards
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.scheduler.remove(&TimerKey::Method);
        for id in self.ordered_ids() {
            self.shutdown_endpoint(id);
        }
    }

    /// Ask the endpoint's transport to stop; it is removed on `Finished`
    pub fn shutdown_endpoint(&mut self, id: EndpointId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let Some(status) = self.endpoint(id).map(Endpoint::status) else {
            return;
        };
        if status >= EndpointStatus::Closing {
            return;
        }

        self.unlink_state(index);
        self.set_status(index, EndpointStatus::Closing);
        if let Some(endpoint) = self.endpoint_at_mut(index) {
            tracing::info!(endpoint = %endpoint.server(), "shutting down endpoint");
            endpoint.shutdown_transport();
        }
        let watchdog = self.config.shutdown_timeout;
        self.schedule(id, watchdog, TimerAction::ShutdownWatchdog);
    }

    /// Place a payload on a ready endpoint
    ///
    /// With several ready endpoints the one with the earliest estimated
    /// delivery wins; endpoints passed over have their latency reduced so
    /// none is starved for good. Endpoints still warming up are skipped
    /// unless every ready endpoint is warming.
    pub fn queue_payload(&mut self, payload: &mut Payload) -> Result<EndpointId, PlacementError> {
        let Some(front) = self.ready.head else {
            return Err(PlacementError::NoReady);
        };

        let lines = payload.remaining();
        let mut best: Option<(u32, Instant)> = None;
        if self.ready.len > 1 {
            let mut cursor = Some(front);
            while let Some(index) = cursor {
                cursor = next_in(&self.slots, index, Chain::State);
                let Some(candidate) = self
                    .endpoint_at(index)
                    .filter(|e| !e.is_warming())
                    .map(|e| e.candidate_del_time(lines))
                else {
                    continue;
                };
                match best {
                    Some((_, at)) if candidate >= at => {
                        if let Some(e) = self.endpoint_at_mut(index) {
                            e.reduce_latency();
                        }
                    }
                    Some((previous, _)) => {
                        if let Some(e) = self.endpoint_at_mut(previous) {
                            e.reduce_latency();
                        }
                        best = Some((index, candidate));
                    }
                    None => best = Some((index, candidate)),
                }
            }
        }
        let chosen = best.map_or(front, |(index, _)| index);

        match self.try_queue(chosen, payload) {
            Ok(id) => Ok(id),
            Err(e) if e.is_congestion() => {
                let mut cursor = self.ready.tail;
                while let Some(index) = cursor {
                    cursor = link(&self.slots, index, Chain::State).and_then(|l| l.prev);
                    let warming = self.endpoint_at(index).is_none_or(Endpoint::is_warming);
                    if index == chosen || warming {
                        continue;
                    }
                    match self.try_queue(index, payload) {
                        Ok(id) => return Ok(id),
                        Err(e) if e.is_congestion() => continue,
                        Err(error) => {
                            return Err(PlacementError::Failed {
                                id: self.id_at(index),
                                error,
                            });
                        }
                    }
                }
                tracing::debug!(ready = self.ready.len, "all ready endpoints congested");
                Err(PlacementError::Congested)
            }
            Err(error) => Err(PlacementError::Failed {
                id: self.id_at(chosen),
                error,
            }),
        }
    }

    /// Schedule `action` for an endpoint, replacing its pending timer
    ///
    /// A pending shutdown watchdog is never replaced: once closing, the
    /// endpoint either finishes or is dropped when the watchdog fires.
    pub fn schedule(&mut self, id: EndpointId, after: Duration, action: TimerAction) {
        let key = TimerKey::Endpoint(id);
        if matches!(self.scheduler.get(&key), Some((_, TimerAction::ShutdownWatchdog))) {
            return;
        }
        self.scheduler.set(key, Instant::now() + after, action);
    }

    /// Arm the method policy's timer
    pub fn schedule_method(&mut self, after: Duration) {
        self.scheduler
            .set(TimerKey::Method, Instant::now() + after, TimerAction::MethodTimer);
    }

    /// Pending timer action for an endpoint
    pub fn scheduled(&self, id: EndpointId) -> Option<(Instant, TimerAction)> {
        self.scheduler
            .get(&TimerKey::Endpoint(id))
            .map(|(due, action)| (due, *action))
    }

    pub fn cancel_timer(&mut self, id: EndpointId) {
        self.scheduler.remove(&TimerKey::Endpoint(id));
    }

    #[inline]
    pub fn next_due(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn send_ping(&mut self, id: EndpointId) -> Result<(), TransportError> {
        match self.node_mut(id) {
            Some(node) => node.endpoint.send_ping(),
            None => Err(TransportError::Closed),
        }
    }

    /// Take back every payload in flight on the endpoint
    pub fn pull_back_pending(&mut self, id: EndpointId) -> Vec<PayloadKey> {
        self.node_mut(id)
            .map(|n| n.endpoint.pull_back_pending())
            .unwrap_or_default()
    }

    /// Fail a live endpoint on the publisher's behalf
    pub fn force_failure(&mut self, id: EndpointId, reason: String, observer: &mut impl SinkObserver) {
        let Some(endpoint) = self.node_mut(id).map(|n| &mut n.endpoint) else {
            return;
        };
        if !endpoint.status().is_alive() {
            return;
        }
        endpoint.fail_transport();
        self.fail(id, reason, false, observer);
    }

    /// Apply one transport event
    pub fn process_event(&mut self, id: EndpointId, event: TransportEvent, observer: &mut impl SinkObserver) {
        let Some(status) = self.endpoint(id).map(Endpoint::status) else {
            tracing::trace!(id = %id, "event for removed endpoint");
            return;
        };

        match event {
            TransportEvent::Started => match status {
                EndpointStatus::Idle => {
                    self.activate(id);
                    observer.on_started(self, id);
                }
                EndpointStatus::Failed => self.recover(id),
                _ => tracing::debug!(id = %id, status = %status, "ignoring start"),
            },
            TransportEvent::Failed { error, fatal } => self.fail(id, error.to_string(), fatal, observer),
            TransportEvent::Finished => self.finish(id, observer),
            TransportEvent::Ack { nonce, sequence } => {
                let max_pending = self.config.max_pending_payloads;
                let Some(index) = self.index_of(id) else {
                    return;
                };
                let Some(endpoint) = self.endpoint_at_mut(index) else {
                    return;
                };
                let Some(ack) = endpoint.process_ack(nonce, sequence) else {
                    tracing::debug!(
                        endpoint = %endpoint.server(),
                        nonce = %nonce,
                        sequence,
                        "ignoring ack for unknown payload"
                    );
                    return;
                };
                let below_limit = endpoint.num_payloads() < max_pending;

                let mut became_ready = false;
                if ack.complete {
                    match status {
                        EndpointStatus::Full if below_limit => {
                            self.set_status(index, EndpointStatus::Active);
                            self.insert_ready(index);
                            became_ready = true;
                        }
                        EndpointStatus::Active => self.reposition_ready(index),
                        _ => {}
                    }
                }

                observer.on_ack(self, id, ack);
                if became_ready {
                    observer.on_ready(self, id);
                }
            }
            TransportEvent::Pong => {
                if let Some(node) = self.node_mut(id) {
                    node.endpoint.process_pong();
                }
                observer.on_pong(self, id);
            }
        }
    }

    /// Run every timer due at `now`
    pub fn process_timers(&mut self, now: Instant, observer: &mut impl SinkObserver) {
        while let Some((key, action)) = self.scheduler.pop_due(now) {
            let id = match key {
                TimerKey::Method => {
                    observer.on_method_timer(self);
                    continue;
                }
                TimerKey::Endpoint(id) => id,
            };
            let Some(status) = self.endpoint(id).map(Endpoint::status) else {
                continue;
            };

            match action {
                TimerAction::MarkActive if status == EndpointStatus::Idle => {
                    self.activate(id);
                    observer.on_started(self, id);
                }
                TimerAction::TimeoutPending => observer.on_timeout(self, id, Timeout::Pending),
                TimerAction::TimeoutKeepalive => observer.on_timeout(self, id, Timeout::Keepalive),
                TimerAction::ShutdownWatchdog => {
                    if let Some(node) = self.node_mut(id) {
                        tracing::warn!(
                            endpoint = %node.endpoint.server(),
                            "transport did not finish after shutdown, dropping it"
                        );
                        node.endpoint.fail_transport();
                    }
                    self.finish(id, observer);
                }
                _ => {}
            }
        }
    }

    /// Per-endpoint status in configuration order
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        self.ordered_ids()
            .into_iter()
            .filter_map(|id| self.endpoint(id))
            .map(EndpointSnapshot::from_endpoint)
            .collect()
    }

    fn activate(&mut self, id: EndpointId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        self.unlink_state(index);
        self.set_status(index, EndpointStatus::Active);
        self.insert_ready(index);
        if let Some(endpoint) = self.endpoint_at(index) {
            tracing::info!(endpoint = %endpoint.server(), "endpoint active");
        }
    }

    /// A failed endpoint's transport reconnected: wait out its backoff
    fn recover(&mut self, id: EndpointId) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        self.unlink_state(index);
        self.set_status(index, EndpointStatus::Idle);
        let Some(endpoint) = self.endpoint_at_mut(index) else {
            return;
        };
        let wait = endpoint.next_backoff();
        tracing::info!(
            endpoint = %endpoint.server(),
            backoff_secs = wait.as_secs_f64(),
            "endpoint recovered, activating after backoff"
        );
        self.schedule(id, wait, TimerAction::MarkActive);
    }

    fn fail(&mut self, id: EndpointId, error: String, fatal: bool, observer: &mut impl SinkObserver) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let Some(endpoint) = self.endpoint_at_mut(index) else {
            return;
        };
        if fatal {
            endpoint.set_fatal();
        }
        let status = endpoint.status();

        match status {
            s if s.is_alive() => {
                if fatal {
                    tracing::error!(endpoint = %endpoint.server(), error = %error, "endpoint failed permanently");
                } else {
                    tracing::warn!(endpoint = %endpoint.server(), error = %error, "endpoint failed");
                }
                endpoint.mark_failed(error);
                self.cancel_timer(id);
                self.unlink_state(index);
                self.failed.insert_before(&mut self.slots, Chain::State, index, None);
                self.set_list(index, Some(StateList::Failed));

                observer.on_fail(self, id);
                if fatal {
                    self.shutdown_endpoint(id);
                }
            }
            EndpointStatus::Failed => {
                tracing::debug!(endpoint = %endpoint.server(), error = %error, "endpoint already failed");
                if fatal {
                    self.shutdown_endpoint(id);
                }
            }
            EndpointStatus::Closing => {
                tracing::debug!(endpoint = %endpoint.server(), error = %error, "transport failed while closing");
                endpoint.shutdown_transport();
            }
            _ => {}
        }
    }

    fn finish(&mut self, id: EndpointId, observer: &mut impl SinkObserver) {
        let Some(index) = self.index_of(id) else {
            return;
        };
        let previous = self.previous(id);

        self.cancel_timer(id);
        self.unlink_state(index);
        self.set_status(index, EndpointStatus::Closed);
        if self.endpoint_at(index).is_some_and(Endpoint::has_pending) {
            observer.on_fail(self, id);
        }

        self.ordered.remove(&mut self.slots, Chain::Order, index);
        let slot = &mut self.slots[index as usize];
        let Some(node) = slot.node.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        let endpoint = node.endpoint;
        let server = endpoint.server().to_string();
        if self.servers.get(&server) == Some(&id) {
            self.servers.remove(&server);
        }
        tracing::info!(endpoint = %server, "endpoint finished");

        if endpoint.is_fatal() || self.shutting_down || !self.config.has_server(&server) {
            return;
        }
        if observer.on_finish(self, &server, previous) {
            let previous = previous.filter(|p| self.endpoint(*p).is_some());
            let previous = match previous {
                Some(p) => Some(p),
                None => self.placement_for(&server),
            };
            self.add_endpoint_after(&server, endpoint.finish_on_fail(), previous);
        }
    }

    /// Where a new endpoint for `server` belongs in the ordered list:
    /// after the nearest existing endpoint configured before it
    pub fn placement_for(&self, server: &str) -> Option<EndpointId> {
        let position = self.config.servers.iter().position(|s| s == server)?;
        self.config.servers[..position]
            .iter()
            .rev()
            .find_map(|s| self.find_endpoint(s))
    }

    /// Re-evaluate the pending limit after a configuration change
    fn reapply_limit(&mut self) {
        let max_pending = self.config.max_pending_payloads;
        for id in self.ordered_ids() {
            let Some(index) = self.index_of(id) else {
                continue;
            };
            let Some(endpoint) = self.endpoint_at(index) else {
                continue;
            };
            match endpoint.status() {
                EndpointStatus::Active if endpoint.num_payloads() >= max_pending => {
                    self.unlink_state(index);
                    self.set_status(index, EndpointStatus::Full);
                }
                EndpointStatus::Full if endpoint.num_payloads() < max_pending => {
                    self.set_status(index, EndpointStatus::Active);
                    self.insert_ready(index);
                }
                _ => {}
            }
        }
    }

    fn try_queue(&mut self, index: u32, payload: &mut Payload) -> Result<EndpointId, TransportError> {
        let max_pending = self.config.max_pending_payloads;
        let Some(endpoint) = self.endpoint_at_mut(index) else {
            return Err(TransportError::Closed);
        };
        endpoint.queue_payload(payload)?;
        tracing::trace!(
            endpoint = %endpoint.server(),
            events = payload.remaining(),
            pending = endpoint.num_payloads(),
            "payload queued"
        );

        if endpoint.num_payloads() >= max_pending {
            tracing::debug!(endpoint = %endpoint.server(), "endpoint full");
            self.unlink_state(index);
            self.set_status(index, EndpointStatus::Full);
        } else {
            self.reposition_ready(index);
        }
        Ok(self.id_at(index))
    }

    /// Insert into the ready list keeping it sorted by payloads in flight
    fn insert_ready(&mut self, index: u32) {
        let pending = self.endpoint_at(index).map_or(0, Endpoint::num_payloads);
        let mut before = self.ready.head;
        while let Some(i) = before {
            if self.endpoint_at(i).is_some_and(|e| e.num_payloads() > pending) {
                break;
            }
            before = next_in(&self.slots, i, Chain::State);
        }
        self.ready.insert_before(&mut self.slots, Chain::State, index, before);
        self.set_list(index, Some(StateList::Ready));
    }

    fn reposition_ready(&mut self, index: u32) {
        if self.list_of(index) == Some(StateList::Ready) {
            self.ready.remove(&mut self.slots, Chain::State, index);
            self.set_list(index, None);
            self.insert_ready(index);
        }
    }

    fn unlink_state(&mut self, index: u32) {
        match self.list_of(index) {
            Some(StateList::Ready) => self.ready.remove(&mut self.slots, Chain::State, index),
            Some(StateList::Failed) => self.failed.remove(&mut self.slots, Chain::State, index),
            None => return,
        }
        self.set_list(index, None);
    }

    fn list_of(&self, index: u32) -> Option<StateList> {
        self.slots.get(index as usize)?.node.as_ref()?.list
    }

    fn set_list(&mut self, index: u32, list: Option<StateList>) {
        if let Some(node) = self.slots.get_mut(index as usize).and_then(|s| s.node.as_mut()) {
            node.list = list;
        }
    }

    fn set_status(&mut self, index: u32, status: EndpointStatus) {
        if let Some(endpoint) = self.endpoint_at_mut(index) {
            endpoint.set_status(status);
        }
    }

    fn id_at(&self, index: u32) -> EndpointId {
        EndpointId {
            index,
            generation: self.slots.get(index as usize).map_or(0, |s| s.generation),
        }
    }

    fn index_of(&self, id: EndpointId) -> Option<u32> {
        self.node(id).map(|_| id.index)
    }

    fn node(&self, id: EndpointId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: EndpointId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    fn endpoint_at(&self, index: u32) -> Option<&Endpoint> {
        self.slots.get(index as usize)?.node.as_ref().map(|n| &n.endpoint)
    }

    fn endpoint_at_mut(&mut self, index: u32) -> Option<&mut Endpoint> {
        self.slots
            .get_mut(index as usize)?
            .node
            .as_mut()
            .map(|n| &mut n.endpoint)
    }
}

#[cfg(test)]
#[path = "sink_test.rs"]
mod sink_test;
