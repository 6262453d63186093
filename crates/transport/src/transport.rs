//! Transport traits and events
//!
//! A transport owns the connection to one endpoint. The publisher loop
//! calls into it synchronously (`write`, `ping`, `fail`, `shutdown`);
//! everything the transport learns travels back as a [`TransportEvent`]
//! on the channel shared by all endpoints.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use courier_protocol::{Event, Nonce, ProtocolError, compress_events};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::metrics::TransportMetrics;
use crate::pool::AddressPool;

/// Identifies an endpoint slot; the generation guards against stale ids
/// after a slot is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// What a transport reports back to the publisher
#[derive(Debug)]
pub enum TransportEvent {
    /// Connected and ready for payloads
    Started,
    /// Connection lost or unusable; `fatal` means do not retry
    Failed { error: TransportError, fatal: bool },
    /// The transport has stopped for good
    Finished,
    /// The first `sequence` events of the payload sent with `nonce` are safe
    Ack { nonce: Nonce, sequence: u32 },
    Pong,
}

impl TransportEvent {
    pub fn failed(error: TransportError) -> Self {
        Self::Failed {
            error,
            fatal: false,
        }
    }
}

/// Channel every transport reports on, tagged with the endpoint id
pub type EventChannel = mpsc::Sender<(EndpointId, TransportEvent)>;

/// Sending half bound to one endpoint
#[derive(Clone)]
pub struct EventSender {
    id: EndpointId,
    tx: EventChannel,
}

impl EventSender {
    pub fn new(id: EndpointId, tx: EventChannel) -> Self {
        Self { id, tx }
    }

    #[inline]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Deliver an event, waiting for room
    ///
    /// Returns false once the publisher has gone away.
    pub async fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).await.is_ok()
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").field("id", &self.id).finish()
    }
}

/// The unacknowledged tail of a payload, as handed to a transport
///
/// The compressed event stream is computed at most once per tail and is
/// shared with the publisher, so a payload resent with the same tail
/// reuses it.
#[derive(Clone)]
pub struct TransportPayload {
    pub nonce: Nonce,
    events: Arc<[Event]>,
    offset: usize,
    compressed: Arc<OnceLock<Bytes>>,
}

impl TransportPayload {
    pub fn new(
        nonce: Nonce,
        events: Arc<[Event]>,
        offset: usize,
        compressed: Arc<OnceLock<Bytes>>,
    ) -> Self {
        let offset = offset.min(events.len());
        Self {
            nonce,
            events,
            offset,
            compressed,
        }
    }

    /// Events to transmit
    #[inline]
    pub fn events(&self) -> &[Event] {
        &self.events[self.offset..]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len() - self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// zlib stream of the events, as carried by `JDAT`/`EVNT`
    pub fn compressed(&self) -> Result<Bytes, ProtocolError> {
        if let Some(bytes) = self.compressed.get() {
            return Ok(bytes.clone());
        }
        let bytes = compress_events(self.events().iter().map(|e| e.encoded().as_ref()))?;
        Ok(self.compressed.get_or_init(|| bytes).clone())
    }
}

impl fmt::Debug for TransportPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPayload")
            .field("nonce", &self.nonce)
            .field("events", &self.len())
            .finish()
    }
}

/// Everything a transport needs to run for one endpoint
#[derive(Clone)]
pub struct TransportContext {
    pub server: String,
    pub pool: Arc<AddressPool>,
    pub events: EventSender,
    pub metrics: Arc<TransportMetrics>,
    /// Emit `Finished` after the first failure instead of reconnecting
    pub finish_on_fail: bool,
}

/// Handle to a running transport
///
/// All methods are called from the publisher loop and must not block.
pub trait Transport: Send {
    /// Queue a payload; `Err(Congestion)` when the queue is full
    fn write(&mut self, payload: TransportPayload) -> Result<(), TransportError>;

    /// Queue a keepalive ping
    fn ping(&mut self) -> Result<(), TransportError>;

    /// Drop the current connection and report `Failed`
    fn fail(&mut self);

    /// Stop for good; the transport reports `Finished` when done
    fn shutdown(&mut self);
}

/// Creates transports for endpoints
pub trait TransportFactory: Send + Sync {
    /// Start a transport. Must be called within a tokio runtime.
    fn new_transport(&self, context: TransportContext) -> Box<dyn Transport>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
