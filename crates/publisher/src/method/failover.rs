use courier_transport::EndpointId;

use super::MethodPolicy;
use crate::sink::EndpointSink;

/// Send to one server at a time, preferring servers listed earlier
///
/// Endpoints for servers before the current one stay connected so they
/// can take over again as soon as they come back.
#[derive(Debug, Default)]
pub struct Failover {
    current: Option<String>,
}

impl Failover {
    /// Server payloads currently go to
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn position(sink: &EndpointSink, server: &str) -> Option<usize> {
        sink.config().servers.iter().position(|s| s == server)
    }

    fn current_position(&self, sink: &EndpointSink) -> Option<usize> {
        self.current
            .as_deref()
            .and_then(|server| Self::position(sink, server))
    }

    /// Shut down endpoints for servers listed after `position`
    fn shutdown_after(sink: &mut EndpointSink, position: usize) {
        for id in sink.ordered_ids() {
            let later = sink
                .endpoint(id)
                .and_then(|e| Self::position(sink, e.server()))
                .is_none_or(|p| p > position);
            if later {
                sink.shutdown_endpoint(id);
            }
        }
    }

    /// Switch to `server`, creating its endpoint in configured order if needed
    fn make_current(&mut self, sink: &mut EndpointSink, server: &str) {
        tracing::info!(endpoint = %server, "failover to server");
        if sink.find_endpoint(server).is_none() {
            let previous = sink.placement_for(server);
            sink.add_endpoint_after(server, false, previous);
        }
        self.current = Some(server.to_string());
    }
}

impl MethodPolicy for Failover {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn reload(&mut self, sink: &mut EndpointSink) {
        // Existing endpoints follow the configured order
        let servers = sink.config().servers.clone();
        let mut previous: Option<EndpointId> = None;
        for server in &servers {
            if let Some(id) = sink.find_endpoint(server) {
                sink.move_endpoint_after(id, previous);
                previous = Some(id);
            }
        }

        let position = match self.current_position(sink) {
            Some(position) => position,
            None => {
                let Some(primary) = servers.first() else {
                    return;
                };
                self.make_current(sink, primary);
                0
            }
        };
        Self::shutdown_after(sink, position);
    }

    fn on_started(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        let Some(server) = sink.endpoint(id).map(|e| e.server().to_string()) else {
            return;
        };
        let Some(position) = Self::position(sink, &server) else {
            return;
        };
        if self.current_position(sink).is_some_and(|current| position > current) {
            return;
        }
        if self.current.as_deref() != Some(server.as_str()) {
            tracing::info!(endpoint = %server, "higher priority server is back");
            self.current = Some(server);
        }
        Self::shutdown_after(sink, position);
    }

    /// Move to the next server once every address of the current one failed
    fn on_fail(&mut self, sink: &mut EndpointSink, id: EndpointId) {
        let Some(endpoint) = sink.endpoint(id) else {
            return;
        };
        if self.current.as_deref() != Some(endpoint.server()) {
            return;
        }
        // Other addresses of the same server come first
        if !endpoint.pool().is_last() {
            tracing::debug!(endpoint = %endpoint.server(), "trying next address before failing over");
            return;
        }

        let servers = &sink.config().servers;
        let Some(position) = self.current_position(sink) else {
            return;
        };
        if servers.len() < 2 {
            return;
        }
        let next_position = (position + 1) % servers.len();
        let next = servers[next_position].clone();
        self.make_current(sink, &next);
        if next_position < position {
            // Wrapped round: later servers wait until the new current fails
            Self::shutdown_after(sink, next_position);
        }
    }

    fn on_finish(&mut self, sink: &mut EndpointSink, server: &str) -> bool {
        match (Self::position(sink, server), self.current_position(sink)) {
            (Some(position), Some(current)) => position <= current,
            _ => false,
        }
    }

    fn is_priority(&self, sink: &EndpointSink, id: EndpointId) -> bool {
        sink.endpoint(id)
            .is_some_and(|e| self.current.as_deref() == Some(e.server()))
    }
}
