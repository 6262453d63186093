use std::sync::Arc;
use std::time::Duration;

use courier_config::NetworkConfig;
use courier_transport::test_utils::{MockTransportFactory, StaticResolver};
use tokio::sync::mpsc;

use super::*;
use crate::endpoint::EndpointStatus;

type Events = mpsc::Receiver<(courier_transport::EndpointId, courier_transport::TransportEvent)>;

/// Sink over mock transports; events are left unread
fn sink(servers: &[&str]) -> (EndpointSink, MockTransportFactory, Events) {
    let config = NetworkConfig {
        servers: servers.iter().map(|s| s.to_string()).collect(),
        rfc2782_srv: false,
        failure_backoff: Duration::from_secs(3),
        ..NetworkConfig::default()
    };
    let factory = MockTransportFactory::new();
    let (tx, rx) = mpsc::channel(64);
    let sink = EndpointSink::new(
        config,
        Arc::new(factory.clone()),
        Arc::new(StaticResolver::new()),
        tx,
    );
    (sink, factory, rx)
}

fn servers(sink: &EndpointSink) -> Vec<String> {
    sink.ordered_ids()
        .into_iter()
        .filter_map(|id| sink.endpoint(id))
        .filter(|e| e.status().is_alive())
        .map(|e| e.server().to_string())
        .collect()
}

fn reconfigure(sink: &mut EndpointSink, list: &[&str]) {
    let config = NetworkConfig {
        servers: list.iter().map(|s| s.to_string()).collect(),
        ..sink.config().clone()
    };
    sink.reload_config(config);
}

#[test]
fn test_for_method() {
    assert_eq!(for_method(Method::Random).name(), "random");
    assert_eq!(for_method(Method::Loadbalance).name(), "loadbalance");
    assert_eq!(for_method(Method::Failover).name(), "failover");
}

#[tokio::test]
async fn test_loadbalance_follows_configured_order() {
    let (mut sink, factory, _events) = sink(&["a:1", "b:1", "c:1"]);
    let mut policy = Loadbalance;
    policy.reload(&mut sink);
    assert_eq!(servers(&sink), ["a:1", "b:1", "c:1"]);

    reconfigure(&mut sink, &["c:1", "a:1", "b:1"]);
    policy.reload(&mut sink);
    assert_eq!(servers(&sink), ["c:1", "a:1", "b:1"]);
    assert_eq!(factory.handles().len(), 3);
    assert!(policy.on_finish(&mut sink, "a:1"));
}

#[tokio::test]
async fn test_random_uses_one_endpoint_and_replaces_it() {
    let (mut sink, factory, _events) = sink(&["a:1", "b:1"]);
    let mut policy = Random::new();
    policy.reload(&mut sink);

    assert_eq!(sink.count(), 1);
    let first = policy.current().unwrap().to_string();
    assert_eq!(factory.handles().len(), 1);

    assert!(!policy.on_finish(&mut sink, &first));
    assert!(policy.current().is_none());
    // Replacement waits for the failure backoff
    let due = sink.next_due().unwrap();
    assert!(due >= tokio::time::Instant::now() + Duration::from_secs(2));

    // A reload while waiting leaves the replacement to the timer
    policy.reload(&mut sink);
    assert_eq!(factory.handles().len(), 1);

    policy.on_timer(&mut sink);
    let second = policy.current().unwrap();
    assert_ne!(second, first);
    assert_eq!(factory.created(second), 1);
}

#[tokio::test]
async fn test_random_ignores_other_servers_finishing() {
    let (mut sink, _factory, _events) = sink(&["a:1"]);
    let mut policy = Random::new();
    policy.reload(&mut sink);
    assert!(!policy.on_finish(&mut sink, "z:1"));
    assert_eq!(policy.current(), Some("a:1"));
    assert!(sink.next_due().is_none());
}

#[tokio::test]
async fn test_random_reload_replaces_removed_server() {
    let (mut sink, _factory, _events) = sink(&["a:1"]);
    let mut policy = Random::new();
    policy.reload(&mut sink);

    reconfigure(&mut sink, &["b:1"]);
    policy.reload(&mut sink);
    assert_eq!(policy.current(), Some("b:1"));
    assert_eq!(servers(&sink), ["b:1"]);
}

#[tokio::test]
async fn test_failover_advances_and_falls_back() {
    let (mut sink, _factory, _events) = sink(&["a:1", "b:1", "c:1"]);
    let mut policy = Failover::default();
    policy.reload(&mut sink);
    assert_eq!(servers(&sink), ["a:1"]);
    assert_eq!(policy.current(), Some("a:1"));

    let a = sink.find_endpoint("a:1").unwrap();
    assert!(policy.is_priority(&sink, a));
    policy.on_fail(&mut sink, a);
    assert_eq!(policy.current(), Some("b:1"));
    assert_eq!(servers(&sink), ["a:1", "b:1"]);
    let b = sink.find_endpoint("b:1").unwrap();
    assert!(!policy.is_priority(&sink, a));
    assert!(policy.is_priority(&sink, b));

    // The earlier server stays and is recreated; later ones are not
    assert!(policy.on_finish(&mut sink, "a:1"));
    assert!(!policy.on_finish(&mut sink, "c:1"));

    // Primary recovers: it takes over and b is let go
    policy.on_started(&mut sink, a);
    assert_eq!(policy.current(), Some("a:1"));
    assert_eq!(
        sink.endpoint(b).map(|e| e.status()),
        Some(EndpointStatus::Closing)
    );
}

#[tokio::test]
async fn test_failover_ignores_non_current_failures() {
    let (mut sink, _factory, _events) = sink(&["a:1", "b:1"]);
    let mut policy = Failover::default();
    policy.reload(&mut sink);
    let a = sink.find_endpoint("a:1").unwrap();
    policy.on_fail(&mut sink, a);
    let b = sink.find_endpoint("b:1").unwrap();

    // a failing again while b is current changes nothing
    policy.on_fail(&mut sink, a);
    assert_eq!(policy.current(), Some("b:1"));

    // b failing wraps round to a, which already exists
    policy.on_fail(&mut sink, b);
    assert_eq!(policy.current(), Some("a:1"));
    assert_eq!(sink.count(), 2);
}

#[tokio::test]
async fn test_failover_wrap_releases_later_servers() {
    let (mut sink, _factory, _events) = sink(&["a:1", "b:1", "c:1"]);
    let mut policy = Failover::default();
    policy.reload(&mut sink);
    let a = sink.find_endpoint("a:1").unwrap();
    policy.on_fail(&mut sink, a);
    let b = sink.find_endpoint("b:1").unwrap();
    policy.on_fail(&mut sink, b);
    let c = sink.find_endpoint("c:1").unwrap();
    assert_eq!(servers(&sink), ["a:1", "b:1", "c:1"]);

    // c was the last resort; back to a and nothing after it stays up
    policy.on_fail(&mut sink, c);
    assert_eq!(policy.current(), Some("a:1"));
    assert_eq!(servers(&sink), ["a:1"]);
    for id in [b, c] {
        assert_eq!(sink.endpoint(id).map(|e| e.status()), Some(EndpointStatus::Closing));
    }
    assert!(policy.on_finish(&mut sink, "a:1"));
    assert!(!policy.on_finish(&mut sink, "b:1"));
    assert!(!policy.on_finish(&mut sink, "c:1"));
}
