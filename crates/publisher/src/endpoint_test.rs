use std::time::Duration;

use courier_protocol::Event;
use courier_transport::test_utils::StaticResolver;
use courier_transport::TransportPayload;
use parking_lot::Mutex;

use super::*;

/// Transport recording writes; optionally congested
#[derive(Clone, Default)]
struct Recorder {
    writes: Arc<Mutex<Vec<TransportPayload>>>,
    congested: Arc<Mutex<bool>>,
}

impl Transport for Recorder {
    fn write(&mut self, payload: TransportPayload) -> Result<(), TransportError> {
        if *self.congested.lock() {
            return Err(TransportError::Congestion);
        }
        self.writes.lock().push(payload);
        Ok(())
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn fail(&mut self) {}

    fn shutdown(&mut self) {}
}

fn endpoint(recorder: &Recorder) -> Endpoint {
    let pool = Arc::new(AddressPool::new(
        "s1:5043",
        None,
        Duration::from_secs(60),
        Arc::new(StaticResolver::new()),
    ));
    let mut endpoint = Endpoint::new(
        "s1:5043".into(),
        pool,
        Box::new(recorder.clone()),
        Arc::default(),
        false,
        Backoff::new(Duration::ZERO, Duration::from_secs(300)),
    );
    endpoint.set_status(EndpointStatus::Active);
    endpoint
}

fn payload(key: PayloadKey, count: usize) -> Payload {
    Payload::new(key, (0..count).map(|i| Event::builder(format!("{i}")).build()).collect())
}

fn last_nonce(recorder: &Recorder) -> Nonce {
    recorder.writes.lock().last().map(|w| w.nonce).unwrap()
}

#[test]
fn test_status_order() {
    assert!(EndpointStatus::Idle < EndpointStatus::Active);
    assert!(EndpointStatus::Full.is_alive());
    assert!(!EndpointStatus::Failed.is_alive());
    assert!(EndpointStatus::Closing > EndpointStatus::Failed);
}

#[tokio::test]
async fn test_queue_requires_active() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);
    endpoint.set_status(EndpointStatus::Idle);
    assert!(endpoint.queue_payload(&mut payload(1, 2)).is_err());
    assert!(recorder.writes.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_then_full_ack() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);
    let mut payload = payload(7, 4);

    endpoint.queue_payload(&mut payload).unwrap();
    assert_eq!(endpoint.num_payloads(), 1);
    assert!(endpoint.is_warming());
    let nonce = last_nonce(&recorder);
    assert_eq!(payload.nonce(), Some(nonce));

    tokio::time::advance(Duration::from_secs(2)).await;

    let partial = endpoint.process_ack(nonce, 1).unwrap();
    assert_eq!(partial, AckOutcome { key: 7, lines: 1, complete: false });

    // A repeated sequence is a liveness signal only
    let repeat = endpoint.process_ack(nonce, 1).unwrap();
    assert_eq!(repeat.lines, 0);
    assert!(!repeat.complete);

    let full = endpoint.process_ack(nonce, 4).unwrap();
    assert_eq!(full, AckOutcome { key: 7, lines: 3, complete: true });
    assert_eq!(endpoint.num_payloads(), 0);
    assert_eq!(endpoint.line_count(), 4);
    assert!(!endpoint.is_warming());
    assert_eq!(endpoint.average_latency(), Duration::from_millis(500));

    assert!(endpoint.process_ack(nonce, 4).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_latency_is_smoothed() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);

    let mut first = payload(1, 1);
    endpoint.queue_payload(&mut first).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    endpoint.process_ack(last_nonce(&recorder), 1);
    assert_eq!(endpoint.average_latency(), Duration::from_secs(1));

    let mut second = payload(2, 1);
    endpoint.queue_payload(&mut second).unwrap();
    assert!(!endpoint.is_warming());
    tokio::time::advance(Duration::from_secs(3)).await;
    endpoint.process_ack(last_nonce(&recorder), 1);

    let latency = endpoint.average_latency().as_secs_f64();
    assert!(latency > 1.0 && latency < 3.0, "latency {latency}");
}

#[tokio::test]
async fn test_ack_sequence_is_clamped() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);
    endpoint.queue_payload(&mut payload(1, 3)).unwrap();

    let outcome = endpoint.process_ack(last_nonce(&recorder), 50).unwrap();
    assert_eq!(outcome.lines, 3);
    assert!(outcome.complete);
}

#[tokio::test]
async fn test_congestion_records_nothing() {
    let recorder = Recorder::default();
    *recorder.congested.lock() = true;
    let mut endpoint = endpoint(&recorder);

    let err = endpoint.queue_payload(&mut payload(1, 3)).unwrap_err();
    assert!(err.is_congestion());
    assert_eq!(endpoint.num_payloads(), 0);
    assert!(!endpoint.is_warming());
}

#[tokio::test]
async fn test_pull_back_and_fail() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);
    endpoint.queue_payload(&mut payload(1, 3)).unwrap();
    endpoint.queue_payload(&mut payload(2, 3)).unwrap();

    let mut keys = endpoint.pull_back_pending();
    keys.sort_unstable();
    assert_eq!(keys, [1, 2]);
    assert!(!endpoint.has_pending());

    endpoint.mark_failed("connection reset".into());
    assert_eq!(endpoint.status(), EndpointStatus::Failed);
    assert_eq!(endpoint.last_error(), Some("connection reset"));
    assert_eq!(endpoint.average_latency(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_reduce_latency_and_candidate_time() {
    let recorder = Recorder::default();
    let mut endpoint = endpoint(&recorder);
    let mut first = payload(1, 1);
    endpoint.queue_payload(&mut first).unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    endpoint.process_ack(last_nonce(&recorder), 1);

    let base = endpoint.est_del_time();
    assert_eq!(endpoint.candidate_del_time(10), base + Duration::from_secs(10));

    endpoint.reduce_latency();
    assert_eq!(endpoint.average_latency(), Duration::from_secs_f64(0.99));
}
