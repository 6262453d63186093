use courier_transport::{Backoff, EndpointId};
use rand::Rng;

use super::MethodPolicy;
use crate::sink::EndpointSink;

/// One endpoint at a time, on a randomly chosen server
///
/// The endpoint finishes on its first failure and is replaced by one for
/// another server after the policy's backoff.
#[derive(Debug)]
pub struct Random {
    current: Option<String>,
    last: Option<String>,
    waiting: bool,
    backoff: Option<Backoff>,
}

impl Random {
    pub fn new() -> Self {
        Self {
            current: None,
            last: None,
            waiting: false,
            backoff: None,
        }
    }

    /// Server the policy's endpoint belongs to
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn add(&mut self, sink: &mut EndpointSink) {
        let servers = &sink.config().servers;
        let candidates: Vec<&String> = match self.last.as_deref() {
            Some(last) if servers.len() > 1 => servers.iter().filter(|s| *s != last).collect(),
            _ => servers.iter().collect(),
        };
        if candidates.is_empty() {
            return;
        }
        let server = candidates[rand::rng().random_range(0..candidates.len())].clone();

        tracing::info!(endpoint = %server, "selected random server");
        sink.add_endpoint(&server, true);
        self.current = Some(server);
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodPolicy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn reload(&mut self, sink: &mut EndpointSink) {
        let config = sink.config();
        self.backoff = Some(Backoff::new(config.failure_backoff, config.failure_backoff_max));

        if self.waiting {
            return;
        }
        match self.current.as_deref() {
            Some(server) if sink.config().has_server(server) => {}
            _ => {
                self.last = self.current.take();
                self.add(sink);
            }
        }
    }

    fn on_started(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        let server = sink.endpoint(id).map(|e| e.server());
        if server.is_some() && server == self.current.as_deref() {
            if let Some(backoff) = &mut self.backoff {
                backoff.reset();
            }
        }
    }

    fn on_finish(&mut self, sink: &mut EndpointSink, server: &str) -> bool {
        if self.current.as_deref() != Some(server) {
            return false;
        }
        self.last = self.current.take();
        self.waiting = true;

        let wait = self
            .backoff
            .as_mut()
            .map_or(std::time::Duration::ZERO, Backoff::trigger);
        tracing::info!(
            endpoint = %server,
            backoff_secs = wait.as_secs_f64(),
            "replacing random endpoint after backoff"
        );
        sink.schedule_method(wait);
        false
    }

    fn on_timer(&mut self, sink: &mut EndpointSink) {
        self.waiting = false;
        if self.current.is_none() {
            self.add(sink);
        }
    }
}
