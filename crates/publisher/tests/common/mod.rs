//! Shared harness: a publisher running over mock transports

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_config::{Method, NetworkConfig};
use courier_protocol::Event;
use courier_publisher::{Commit, EndpointSnapshot, EndpointStatus, Publisher, StatusHandle};
use courier_transport::TransportPayload;
use courier_transport::test_utils::{MockHandle, MockTransportFactory, StaticResolver};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Running {
    pub factory: MockTransportFactory,
    pub spool: Option<mpsc::Sender<Vec<Event>>>,
    pub reload: mpsc::Sender<NetworkConfig>,
    pub commits: mpsc::UnboundedReceiver<Commit>,
    pub status: StatusHandle,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<()>,
}

pub fn config(servers: &[&str], method: Method) -> NetworkConfig {
    NetworkConfig {
        servers: servers.iter().map(|s| s.to_string()).collect(),
        method,
        rfc2782_srv: false,
        ..NetworkConfig::default()
    }
}

pub fn start(config: NetworkConfig, factory: MockTransportFactory) -> Running {
    let (commits_tx, commits) = mpsc::unbounded_channel();
    let publisher = Publisher::builder(config)
        .registrar(commits_tx)
        .factory(Arc::new(factory.clone()))
        .resolver(Arc::new(StaticResolver::new()))
        .build()
        .expect("valid publisher config");

    let (spool, spool_rx) = mpsc::channel(4);
    let (reload, reload_rx) = mpsc::channel(4);
    let shutdown = CancellationToken::new();
    let status = publisher.status_handle();
    let task = tokio::spawn(publisher.run(spool_rx, reload_rx, shutdown.clone()));

    Running {
        factory,
        spool: Some(spool),
        reload,
        commits,
        status,
        shutdown,
        task,
    }
}

/// Events from one source with offsets `first..first + count`
pub fn lines(prefix: &str, first: u64, count: u64) -> Vec<Event> {
    (first..first + count)
        .map(|offset| {
            Event::builder(format!("{prefix} {offset}"))
                .source("/var/log/app.log")
                .offset(offset)
                .build()
        })
        .collect()
}

/// Poll until `condition` holds, advancing time in small steps
pub async fn until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait for `count` writes on `handle` and take them
pub async fn writes(handle: &MockHandle, count: usize) -> Vec<TransportPayload> {
    until("writes", || handle.write_count() >= count).await;
    handle.take_writes()
}

impl Running {
    pub async fn send(&self, events: Vec<Event>) {
        self.spool
            .as_ref()
            .expect("spool open")
            .send(events)
            .await
            .expect("publisher running");
    }

    pub async fn next_commit(&mut self) -> Commit {
        tokio::time::timeout(Duration::from_secs(30), self.commits.recv())
            .await
            .expect("timed out waiting for a commit")
            .expect("registrar channel closed")
    }

    pub fn endpoint(&self, server: &str) -> Option<EndpointSnapshot> {
        self.status
            .get()
            .endpoints
            .into_iter()
            .find(|e| e.server == server)
    }

    pub async fn until_status(&self, server: &str, status: EndpointStatus) {
        until(&format!("{server} {status}"), || {
            self.endpoint(server).is_some_and(|e| e.status == status)
        })
        .await;
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(60), self.task)
            .await
            .expect("publisher did not stop")
            .expect("publisher task panicked");
    }
}
