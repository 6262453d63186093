use courier_transport::EndpointId;

use super::MethodPolicy;
use crate::sink::EndpointSink;

/// Every configured server gets an endpoint; payloads spread across all
/// of them
#[derive(Debug, Default)]
pub struct Loadbalance;

impl MethodPolicy for Loadbalance {
    fn name(&self) -> &'static str {
        "loadbalance"
    }

    fn reload(&mut self, sink: &mut EndpointSink) {
        let servers = sink.config().servers.clone();
        let mut previous: Option<EndpointId> = None;
        for server in &servers {
            let id = match sink.find_endpoint(server) {
                Some(id) => {
                    sink.move_endpoint_after(id, previous);
                    id
                }
                None => sink.add_endpoint_after(server, false, previous),
            };
            previous = Some(id);
        }
    }

    fn on_finish(&mut self, _sink: &mut EndpointSink, _server: &str) -> bool {
        true
    }
}
