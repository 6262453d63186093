use std::time::Duration;

use courier_protocol::Event;
use courier_transport::test_utils::{MockTransportFactory, StaticResolver};
use tokio::sync::mpsc;

use super::*;

/// Observer that records callbacks and pulls back payloads on failure
#[derive(Default)]
struct Recorder {
    started: Vec<EndpointId>,
    ready: Vec<EndpointId>,
    acks: Vec<(EndpointId, AckOutcome)>,
    failed: Vec<(EndpointId, Vec<PayloadKey>)>,
    finished: Vec<String>,
    recreate: bool,
    timeouts: Vec<(EndpointId, Timeout)>,
    method_timers: usize,
}

impl SinkObserver for Recorder {
    fn on_started(&mut self, _sink: &mut EndpointSink, id: EndpointId) {
        self.started.push(id);
    }

    fn on_ready(&mut self, _sink: &mut EndpointSink, id: EndpointId) {
        self.ready.push(id);
    }

    fn on_ack(&mut self, _sink: &mut EndpointSink, id: EndpointId, ack: AckOutcome) {
        self.acks.push((id, ack));
    }

    fn on_pong(&mut self, _sink: &mut EndpointSink, _id: EndpointId) {}

    fn on_fail(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        let mut keys = sink.pull_back_pending(id);
        keys.sort_unstable();
        self.failed.push((id, keys));
    }

    fn on_finish(&mut self, _sink: &mut EndpointSink, server: &str, _previous: Option<EndpointId>) -> bool {
        self.finished.push(server.to_string());
        self.recreate
    }

    fn on_timeout(&mut self, _sink: &mut EndpointSink, id: EndpointId, timeout: Timeout) {
        self.timeouts.push((id, timeout));
    }

    fn on_method_timer(&mut self, _sink: &mut EndpointSink) {
        self.method_timers += 1;
    }
}

struct Harness {
    sink: EndpointSink,
    rx: mpsc::Receiver<(EndpointId, TransportEvent)>,
    factory: MockTransportFactory,
    observer: Recorder,
}

impl Harness {
    fn new(servers: &[&str], configure: impl FnOnce(&mut NetworkConfig)) -> Self {
        let mut config = NetworkConfig {
            servers: servers.iter().map(|s| s.to_string()).collect(),
            rfc2782_srv: false,
            ..NetworkConfig::default()
        };
        configure(&mut config);
        let factory = MockTransportFactory::new();
        let (tx, rx) = mpsc::channel(64);
        let sink = EndpointSink::new(
            config,
            Arc::new(factory.clone()),
            Arc::new(StaticResolver::new()),
            tx,
        );
        Self {
            sink,
            rx,
            factory,
            observer: Recorder::default(),
        }
    }

    /// Process the next transport event
    async fn step(&mut self) {
        let (id, event) = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        self.sink.process_event(id, event, &mut self.observer);
    }

    /// Add an endpoint and bring it to Active
    async fn active(&mut self, server: &str) -> EndpointId {
        let id = self.sink.add_endpoint(server, false);
        self.factory.latest(server).unwrap().start();
        self.step().await;
        assert_eq!(self.status(id), Some(EndpointStatus::Active));
        id
    }

    fn status(&self, id: EndpointId) -> Option<EndpointStatus> {
        self.sink.endpoint(id).map(Endpoint::status)
    }
}

fn payload(key: PayloadKey, count: usize) -> Payload {
    Payload::new(key, (0..count).map(|i| Event::builder(format!("{key}-{i}")).build()).collect())
}

#[tokio::test]
async fn test_ordered_list_operations() {
    let mut h = Harness::new(&["a", "b", "c", "d"], |_| {});
    let a = h.sink.add_endpoint("a", false);
    let b = h.sink.add_endpoint("b", false);
    let c = h.sink.add_endpoint("c", false);
    let d = h.sink.add_endpoint_after("d", false, Some(a));
    assert_eq!(h.sink.ordered_ids(), [a, d, b, c]);

    h.sink.move_endpoint_after(c, None);
    assert_eq!(h.sink.ordered_ids(), [c, a, d, b]);
    assert_eq!(h.sink.front(), Some(c));
    assert_eq!(h.sink.next(a), Some(d));
    assert_eq!(h.sink.previous(a), Some(c));
    assert_eq!(h.sink.next(b), None);

    assert_eq!(h.sink.add_endpoint("a", false), a);
    assert_eq!(h.sink.count(), 4);
    assert_eq!(h.sink.find_endpoint("d"), Some(d));
    assert_eq!(h.factory.created("a"), 1);
}

#[tokio::test]
async fn test_started_endpoint_becomes_ready() {
    let mut h = Harness::new(&["a"], |_| {});
    let id = h.sink.add_endpoint("a", false);
    assert_eq!(h.status(id), Some(EndpointStatus::Idle));
    assert!(!h.sink.has_ready());

    h.factory.latest("a").unwrap().start();
    h.step().await;
    assert_eq!(h.status(id), Some(EndpointStatus::Active));
    assert_eq!(h.sink.ready_ids(), [id]);
    assert_eq!(h.observer.started, [id]);

    // A second start is ignored
    h.factory.latest("a").unwrap().start();
    h.step().await;
    assert_eq!(h.observer.started.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_placement_skips_warming_endpoints() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    let a = h.active("a").await;
    let b = h.active("b").await;

    assert_eq!(h.sink.queue_payload(&mut payload(1, 2)).unwrap(), a);
    // a has nothing acknowledged yet, so it is warming
    assert_eq!(h.sink.queue_payload(&mut payload(2, 2)).unwrap(), b);
    // Everyone warming: the ready front takes it
    assert_eq!(h.sink.queue_payload(&mut payload(3, 2)).unwrap(), a);

    assert_eq!(h.factory.latest("a").unwrap().write_count(), 2);
    assert_eq!(h.factory.latest("b").unwrap().write_count(), 1);
    assert_eq!(h.sink.ready_ids(), [b, a]);
}

#[tokio::test(start_paused = true)]
async fn test_equally_fast_endpoints_share_placements() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    let a = h.active("a").await;
    let b = h.active("b").await;

    let mut placed: HashMap<EndpointId, usize> = HashMap::new();
    for key in 1..=400 {
        let id = h.sink.queue_payload(&mut payload(key, 2)).unwrap();
        *placed.entry(id).or_default() += 1;

        tokio::time::advance(Duration::from_millis(5)).await;
        let handle = h.factory.latest(if id == a { "a" } else { "b" }).unwrap();
        let sent = handle.take_writes();
        assert_eq!(sent.len(), 1);
        handle.ack_all(&sent[0]);
        h.step().await;
    }

    assert_eq!(h.observer.acks.len(), 400);
    for id in [a, b] {
        let count = placed.get(&id).copied().unwrap_or_default();
        assert!((150..=250).contains(&count), "{id:?} got {count} of 400");
    }
}

#[tokio::test]
async fn test_congestion_moves_to_another_endpoint() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    let a = h.active("a").await;
    let b = h.active("b").await;
    h.factory.latest("a").unwrap().set_congested(true);

    assert_eq!(h.sink.queue_payload(&mut payload(1, 1)).unwrap(), b);
    assert_eq!(h.status(a), Some(EndpointStatus::Active));

    h.factory.latest("b").unwrap().set_congested(true);
    assert!(matches!(
        h.sink.queue_payload(&mut payload(2, 1)),
        Err(PlacementError::Congested)
    ));
}

#[tokio::test]
async fn test_full_endpoint_returns_after_ack() {
    let mut h = Harness::new(&["a"], |c| c.max_pending_payloads = 2);
    let a = h.active("a").await;

    h.sink.queue_payload(&mut payload(1, 2)).unwrap();
    h.sink.queue_payload(&mut payload(2, 2)).unwrap();
    assert_eq!(h.status(a), Some(EndpointStatus::Full));
    assert!(!h.sink.has_ready());
    assert!(matches!(
        h.sink.queue_payload(&mut payload(3, 2)),
        Err(PlacementError::NoReady)
    ));

    let handle = h.factory.latest("a").unwrap();
    let writes = handle.take_writes();

    // A partial ack keeps it full
    handle.ack(writes[0].nonce, 1);
    h.step().await;
    assert_eq!(h.status(a), Some(EndpointStatus::Full));

    handle.ack_all(&writes[0]);
    h.step().await;
    assert_eq!(h.status(a), Some(EndpointStatus::Active));
    assert_eq!(h.observer.ready, [a]);
    assert_eq!(
        h.observer.acks.last().map(|(_, ack)| *ack),
        Some(AckOutcome {
            key: 1,
            lines: 1,
            complete: true
        })
    );
}

#[tokio::test]
async fn test_unknown_ack_is_ignored() {
    let mut h = Harness::new(&["a"], |_| {});
    h.active("a").await;
    h.factory
        .latest("a")
        .unwrap()
        .ack(courier_protocol::Nonce::random(), 3);
    h.step().await;
    assert!(h.observer.acks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_pulls_back_and_recovers_after_backoff() {
    let mut h = Harness::new(&["a"], |c| c.failure_backoff = Duration::from_secs(2));
    let a = h.active("a").await;
    h.sink.queue_payload(&mut payload(4, 3)).unwrap();

    let handle = h.factory.latest("a").unwrap();
    handle.fail(TransportError::Closed);
    h.step().await;
    assert_eq!(h.status(a), Some(EndpointStatus::Failed));
    assert_eq!(h.observer.failed, [(a, vec![4])]);
    assert_eq!(h.sink.failed_count(), 1);
    assert!(!h.sink.has_ready());
    assert!(h.sink.endpoint(a).unwrap().last_error().is_some());

    handle.start();
    h.step().await;
    assert_eq!(h.status(a), Some(EndpointStatus::Idle));
    assert_eq!(h.sink.failed_count(), 0);
    let (due, action) = h.sink.scheduled(a).unwrap();
    assert_eq!(action, TimerAction::MarkActive);

    h.sink.process_timers(due - Duration::from_millis(1), &mut h.observer);
    assert_eq!(h.status(a), Some(EndpointStatus::Idle));

    tokio::time::advance(Duration::from_secs(2)).await;
    h.sink.process_timers(Instant::now(), &mut h.observer);
    assert_eq!(h.status(a), Some(EndpointStatus::Active));
    assert_eq!(h.observer.started, [a, a]);
}

#[tokio::test]
async fn test_forced_failure_reported_once() {
    let mut h = Harness::new(&["a"], |_| {});
    let a = h.active("a").await;

    h.sink
        .force_failure(a, "no response within timeout".into(), &mut h.observer);
    assert_eq!(h.status(a), Some(EndpointStatus::Failed));
    assert_eq!(h.factory.latest("a").unwrap().failures_requested(), 1);
    assert_eq!(
        h.sink.endpoint(a).unwrap().last_error(),
        Some("no response within timeout")
    );

    // The transport's own Failed(Forced) follows
    h.step().await;
    assert_eq!(h.observer.failed.len(), 1);
}

#[tokio::test]
async fn test_finished_endpoint_is_recreated() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    let a = h.active("a").await;
    let b = h.active("b").await;
    h.sink.queue_payload(&mut payload(9, 1)).unwrap();
    h.observer.recreate = true;

    let handle = h.factory.latest("a").unwrap();
    handle.finish();
    h.step().await;

    assert!(h.sink.endpoint(a).is_none());
    assert_eq!(h.observer.finished, ["a"]);
    assert_eq!(h.observer.failed, [(a, vec![9])]);
    assert_eq!(h.factory.created("a"), 2);

    let recreated = h.sink.find_endpoint("a").unwrap();
    assert_ne!(recreated, a);
    assert_eq!(recreated.index, a.index);
    assert_eq!(h.sink.ordered_ids(), [recreated, b]);

    // Events from the old generation no longer reach anything
    handle.start();
    h.step().await;
    assert_eq!(h.status(recreated), Some(EndpointStatus::Idle));
}

#[tokio::test]
async fn test_fatal_failure_is_not_recreated() {
    let mut h = Harness::new(&["a"], |_| {});
    let a = h.active("a").await;
    h.observer.recreate = true;

    let handle = h.factory.latest("a").unwrap();
    handle.fail_fatal(TransportError::Unexpected("table schema mismatch"));
    h.step().await;
    assert_eq!(h.status(a), Some(EndpointStatus::Closing));
    assert!(handle.is_shut_down());

    h.step().await;
    assert_eq!(h.sink.count(), 0);
    assert!(h.observer.finished.is_empty());
    assert_eq!(h.factory.created("a"), 1);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    h.active("a").await;
    h.sink.add_endpoint("b", false);
    h.observer.recreate = true;

    h.sink.shutdown();
    assert!(h.sink.is_shutting_down());
    assert!(!h.sink.can_queue());
    h.step().await;
    h.step().await;
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.factory.created("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_watchdog_drops_endpoint() {
    let mut h = Harness::new(&["a"], |c| c.shutdown_timeout = Duration::from_secs(10));
    let a = h.active("a").await;

    // The Finished event is left unread to simulate a stuck transport
    h.sink.shutdown();
    assert_eq!(h.sink.scheduled(a).map(|(_, action)| action), Some(TimerAction::ShutdownWatchdog));

    tokio::time::advance(Duration::from_secs(10)).await;
    h.sink.process_timers(Instant::now(), &mut h.observer);
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.factory.latest("a").unwrap().failures_requested(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_survives_late_timers() {
    let mut h = Harness::new(&["a"], |c| c.shutdown_timeout = Duration::from_secs(10));
    let a = h.active("a").await;

    h.sink.shutdown_endpoint(a);
    // Acks and pongs still arriving from a closing transport re-arm timers
    h.sink.schedule(a, Duration::from_secs(15), TimerAction::TimeoutPending);
    h.sink.schedule(a, Duration::from_secs(900), TimerAction::TimeoutKeepalive);
    let (due, action) = h.sink.scheduled(a).unwrap();
    assert_eq!(action, TimerAction::ShutdownWatchdog);
    assert_eq!(due, Instant::now() + Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(10)).await;
    h.sink.process_timers(Instant::now(), &mut h.observer);
    assert_eq!(h.sink.count(), 0);
    assert!(h.observer.timeouts.is_empty());
}

#[tokio::test]
async fn test_reload_shuts_down_removed_servers() {
    let mut h = Harness::new(&["a", "b"], |_| {});
    let a = h.active("a").await;
    let b = h.active("b").await;
    h.observer.recreate = true;

    let config = NetworkConfig {
        servers: vec!["b".into()],
        ..h.sink.config().clone()
    };
    h.sink.reload_config(config);
    assert_eq!(h.status(a), Some(EndpointStatus::Closing));
    assert_eq!(h.status(b), Some(EndpointStatus::Active));

    h.step().await;
    assert!(h.sink.find_endpoint("a").is_none());
    assert!(h.observer.finished.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timers_reach_the_observer() {
    let mut h = Harness::new(&["a"], |_| {});
    let a = h.active("a").await;

    h.sink.schedule(a, Duration::from_secs(5), TimerAction::TimeoutKeepalive);
    h.sink.schedule_method(Duration::from_secs(1));
    assert_eq!(h.sink.next_due(), Some(Instant::now() + Duration::from_secs(1)));

    tokio::time::advance(Duration::from_secs(5)).await;
    h.sink.process_timers(Instant::now(), &mut h.observer);
    assert_eq!(h.observer.method_timers, 1);
    assert_eq!(h.observer.timeouts, [(a, Timeout::Keepalive)]);
    assert!(h.sink.next_due().is_none());
}
