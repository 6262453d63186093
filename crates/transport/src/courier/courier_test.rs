use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use courier_config::{ReceiverConfig, TlsConfig};
use courier_protocol::{Event, Handshake, Message, Nonce, encode, tag};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::error::TransportError;
use crate::metrics::TransportMetrics;
use crate::pool::AddressPool;
use crate::test_utils::StaticResolver;
use crate::transport::{EndpointId, EventSender, TransportEvent, TransportPayload};

type Events = mpsc::Receiver<(EndpointId, TransportEvent)>;

fn network(max_pending: usize) -> NetworkConfig {
    NetworkConfig {
        transport: TransportKind::Tcp,
        timeout: Duration::from_secs(5),
        max_pending_payloads: max_pending,
        ..Default::default()
    }
}

fn context(addr: SocketAddr) -> (TransportContext, Events) {
    let (tx, rx) = mpsc::channel(64);
    let server = addr.to_string();
    let context = TransportContext {
        pool: Arc::new(AddressPool::new(
            server.clone(),
            None,
            Duration::from_secs(60),
            Arc::new(StaticResolver::new()),
        )),
        server,
        events: EventSender::new(EndpointId { index: 0, generation: 0 }, tx),
        metrics: Arc::new(TransportMetrics::default()),
        finish_on_fail: false,
    };
    (context, rx)
}

fn payload(count: usize) -> TransportPayload {
    let events: Vec<Event> = (0..count)
        .map(|i| Event::builder(format!("line {i}")).offset(i as u64).build())
        .collect();
    TransportPayload::new(Nonce::random(), events.into(), 0, Arc::default())
}

async fn next_event(rx: &mut Events) -> TransportEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event channel closed")
        .1
}

/// Read one frame header plus body and return its tag
async fn read_tag(stream: &mut tokio::net::TcpStream) -> [u8; 4] {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    [header[0], header[1], header[2], header[3]]
}

/// Server that answers `HELO` with `reply` and reports the tag of the next frame
async fn scripted_server(reply: Message) -> (SocketAddr, oneshot::Receiver<[u8; 4]>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_tag(&mut stream).await, tag::HELO);
        let mut rest = [0u8; 20];
        stream.read_exact(&mut rest).await.unwrap();

        let mut frame = BytesMut::new();
        encode(&reply, &mut frame).unwrap();
        stream.write_all(&frame).await.unwrap();

        let data_tag = read_tag(&mut stream).await;
        let _ = tx.send(data_tag);
        // Hold the connection open until the client goes away
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });

    (addr, rx)
}

#[tokio::test]
async fn test_modern_server_gets_evnt() {
    let (addr, data_tag) = scripted_server(Message::Vers(Handshake::current(true))).await;
    let factory = CourierFactory::new(&network(4)).unwrap();
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    transport.write(payload(3)).unwrap();
    assert_eq!(data_tag.await.unwrap(), tag::EVNT);
    transport.shutdown();
}

#[tokio::test]
async fn test_legacy_server_gets_jdat() {
    let (addr, data_tag) = scripted_server(Message::Unknown).await;
    let factory = CourierFactory::new(&network(4)).unwrap();
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    transport.write(payload(3)).unwrap();
    assert_eq!(data_tag.await.unwrap(), tag::JDAT);
    transport.shutdown();
}

#[tokio::test]
async fn test_server_without_evnt_flag_gets_jdat() {
    let (addr, data_tag) = scripted_server(Message::Vers(Handshake::current(false))).await;
    let factory = CourierFactory::new(&network(4)).unwrap();
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    transport.write(payload(1)).unwrap();
    assert_eq!(data_tag.await.unwrap(), tag::JDAT);
    transport.shutdown();
}

#[tokio::test]
async fn test_full_queue_is_congestion() {
    // Accepts but never answers the handshake, so nothing is dequeued
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let factory = CourierFactory::new(&network(2)).unwrap();
    let (context, _events) = context(addr);
    let mut transport = factory.new_transport(context);

    transport.write(payload(1)).unwrap();
    transport.write(payload(1)).unwrap();
    assert!(transport.write(payload(1)).unwrap_err().is_congestion());
    assert!(transport.ping().unwrap_err().is_congestion());
    transport.shutdown();
}

#[tokio::test]
async fn test_roundtrip_with_receiver() {
    let (receiver, mut payloads) = CourierReceiver::bind("127.0.0.1:0", None, 8).await.unwrap();
    let addr = receiver.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    let factory = CourierFactory::new(&network(4)).unwrap();
    let (context, mut events) = context(addr);
    let metrics = Arc::clone(&context.metrics);
    let mut transport = factory.new_transport(context);
    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));

    let sent = payload(6);
    let nonce = sent.nonce;
    transport.write(sent).unwrap();

    let received = payloads.recv().await.unwrap();
    assert_eq!(received.nonce, nonce);
    assert_eq!(received.events.len(), 6);
    assert_eq!(received.events[5].message(), "line 5");

    received.acker.ack(nonce, 2);
    match next_event(&mut events).await {
        TransportEvent::Ack { nonce: n, sequence } => {
            assert_eq!(n, nonce);
            assert_eq!(sequence, 2);
        }
        other => panic!("expected ack, got {other:?}"),
    }
    received.ack_all();
    match next_event(&mut events).await {
        TransportEvent::Ack { sequence, .. } => assert_eq!(sequence, 6),
        other => panic!("expected ack, got {other:?}"),
    }

    transport.ping().unwrap();
    assert!(matches!(next_event(&mut events).await, TransportEvent::Pong));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.payloads_sent, 1);
    assert_eq!(snapshot.acks_received, 2);
    assert_eq!(snapshot.reconnects, 1);

    transport.shutdown();
    assert!(matches!(next_event(&mut events).await, TransportEvent::Finished));
    cancel.cancel();
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut helo = [0u8; 28];
            stream.read_exact(&mut helo).await.unwrap();
            let mut frame = BytesMut::new();
            encode(&Message::Vers(Handshake::current(true)), &mut frame).unwrap();
            stream.write_all(&frame).await.unwrap();
            // Drop the connection right after the handshake
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let factory = CourierFactory::new(&network(4)).unwrap();
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    assert!(matches!(next_event(&mut events).await, TransportEvent::Failed { fatal: false, .. }));
    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    transport.shutdown();
}

#[tokio::test]
async fn test_fail_request_reports_failure() {
    let (addr, _tag) = scripted_server(Message::Vers(Handshake::current(true))).await;
    let factory = CourierFactory::new(&network(4)).unwrap();
    let (mut context, mut events) = context(addr);
    context.finish_on_fail = true;
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));
    transport.fail();
    match next_event(&mut events).await {
        TransportEvent::Failed { error, fatal } => {
            assert!(matches!(error, TransportError::Forced));
            assert!(!fatal);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, TransportEvent::Finished));
}

#[tokio::test]
async fn test_tls_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    fs::write(&cert, certified.cert.pem()).unwrap();
    fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

    let server_tls = tls::server_config(&ReceiverConfig {
        tls: true,
        ssl_certificate: Some(cert.clone()),
        ssl_key: Some(key),
        ..Default::default()
    })
    .unwrap();
    let (receiver, mut payloads) = CourierReceiver::bind("127.0.0.1:0", Some(server_tls), 8)
        .await
        .unwrap();
    let addr = receiver.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    let network = NetworkConfig {
        transport: TransportKind::Tls,
        tls: TlsConfig {
            ssl_ca: vec![cert],
            server_name: Some("localhost".to_string()),
            ..Default::default()
        },
        ..network(4)
    };
    let factory = CourierFactory::new(&network).unwrap();
    assert_eq!(factory.name(), "tls");
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);
    assert!(matches!(next_event(&mut events).await, TransportEvent::Started));

    transport.write(payload(2)).unwrap();
    let received = payloads.recv().await.unwrap();
    assert_eq!(received.events.len(), 2);
    received.ack_all();
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Ack { sequence: 2, .. }
    ));

    transport.shutdown();
    cancel.cancel();
}

#[tokio::test]
async fn test_tls_wrong_name_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    fs::write(&cert, certified.cert.pem()).unwrap();
    fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

    let server_tls = tls::server_config(&ReceiverConfig {
        tls: true,
        ssl_certificate: Some(cert.clone()),
        ssl_key: Some(key),
        ..Default::default()
    })
    .unwrap();
    let (receiver, _payloads) = CourierReceiver::bind("127.0.0.1:0", Some(server_tls), 8)
        .await
        .unwrap();
    let addr = receiver.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(receiver.run(cancel.clone()));

    let network = NetworkConfig {
        transport: TransportKind::Tls,
        tls: TlsConfig {
            ssl_ca: vec![cert],
            server_name: Some("logs.example.com".to_string()),
            ..Default::default()
        },
        ..network(4)
    };
    let factory = CourierFactory::new(&network).unwrap();
    let (context, mut events) = context(addr);
    let mut transport = factory.new_transport(context);

    assert!(matches!(next_event(&mut events).await, TransportEvent::Failed { .. }));
    transport.shutdown();
    cancel.cancel();
}
