//! Receive command - run a courier receiver
//!
//! Every received event is printed to stdout as one JSON line and the
//! payload is acknowledged once printed.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use courier_config::{Config, validate_receiver};
use courier_protocol::Event;
use courier_transport::{CourierReceiver, ReceivedPayload, tls};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive command arguments
#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Listen address, replacing `receiver.listen`
    #[arg(long)]
    pub listen: Option<String>,

    /// Payloads that may wait to be printed before connections stop reading
    #[arg(long, default_value_t = 16)]
    pub capacity: usize,
}

/// Run the receive command
pub async fn run(args: ReceiveArgs, config: Config) -> Result<()> {
    let mut receiver_config = config.receiver.unwrap_or_default();
    if let Some(listen) = args.listen {
        receiver_config.listen = listen;
    }
    validate_receiver(&receiver_config).context("invalid receiver configuration")?;

    let tls = if receiver_config.tls {
        Some(tls::server_config(&receiver_config).context("failed to load receiver TLS material")?)
    } else {
        None
    };
    let (receiver, mut payloads) =
        CourierReceiver::bind(&receiver_config.listen, tls, args.capacity)
            .await
            .context("failed to start receiver")?;

    let cancel = CancellationToken::new();
    let mut server = tokio::spawn(receiver.run(cancel.clone()));
    let mut printed = 0u64;
    let shutdown = super::wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping receiver...");
                break;
            }
            result = &mut server => {
                result.context("receiver task failed")??;
                return Ok(());
            }
            payload = payloads.recv() => match payload {
                Some(payload) => printed += print_payload(&payload)?,
                None => break,
            },
        }
    }

    cancel.cancel();
    server.await.context("receiver task failed")??;
    info!(events = printed, "receiver stopped");
    Ok(())
}

fn print_payload(payload: &ReceivedPayload) -> Result<u64> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &payload.events {
        let line = serde_json::to_string(&event_json(event))?;
        writeln!(out, "{line}").context("failed to write to stdout")?;
    }
    out.flush().context("failed to write to stdout")?;

    debug!(peer = %payload.peer, nonce = %payload.nonce, events = payload.events.len(), "payload printed");
    if !payload.ack_all() {
        warn!(peer = %payload.peer, "connection closed before payload was acknowledged");
    }
    Ok(payload.events.len() as u64)
}

/// An event as printed: its fields plus `@timestamp`, `message`, `source`
/// and `offset`
fn event_json(event: &Event) -> Value {
    let mut object: Map<String, Value> = event.fields().clone();
    object.insert("@timestamp".to_string(), json!(event.timestamp().to_rfc3339()));
    object.insert("message".to_string(), json!(event.message()));
    if !event.source().is_empty() {
        object.insert("source".to_string(), json!(event.source()));
    }
    if let Some(offset) = event.offset() {
        object.insert("offset".to_string(), json!(offset));
    }
    Value::Object(object)
}
