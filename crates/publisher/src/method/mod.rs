//! Method policies
//!
//! A policy decides which endpoints the sink holds and reacts to their
//! lifecycle. The publisher forwards sink callbacks to the active policy.

mod failover;
mod loadbalance;
mod random;

pub use failover::Failover;
pub use loadbalance::Loadbalance;
pub use random::Random;

use courier_config::Method;
use courier_transport::EndpointId;

use crate::sink::EndpointSink;

pub trait MethodPolicy: Send {
    fn name(&self) -> &'static str;

    /// Bring the sink's endpoints in line with its current configuration
    fn reload(&mut self, sink: &mut EndpointSink);

    fn on_started(&mut self, _sink: &mut EndpointSink, _id: EndpointId) {}

    fn on_fail(&mut self, _sink: &mut EndpointSink, _id: EndpointId) {}

    /// Whether a finished endpoint for a configured server is recreated
    fn on_finish(&mut self, sink: &mut EndpointSink, server: &str) -> bool;

    /// The timer armed with [`EndpointSink::schedule_method`] fired
    fn on_timer(&mut self, _sink: &mut EndpointSink) {}

    /// Whether a newly ready endpoint should be sent payloads right away
    fn is_priority(&self, _sink: &EndpointSink, _id: EndpointId) -> bool {
        true
    }
}

/// Policy for a configured method
pub fn for_method(method: Method) -> Box<dyn MethodPolicy> {
    match method {
        Method::Random => Box::new(Random::new()),
        Method::Loadbalance => Box::new(Loadbalance),
        Method::Failover => Box::new(Failover::default()),
    }
}

#[cfg(test)]
#[path = "method_test.rs"]
mod method_test;
