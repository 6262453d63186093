//! Courier client transport
//!
//! The handle returned to the endpoint only enqueues; a background task
//! owns the socket. Payloads travel over a bounded queue sized to the
//! endpoint's pending limit, so a full queue surfaces as congestion.
//! Fail and shutdown requests use a separate unbounded control channel so
//! they are never stuck behind payloads.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use courier_protocol::{FrameDecoder, Handshake, Message, encode, encode_data_frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::writer::DeadlineWriter;
use super::{CourierSettings, configure_socket};
use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::metrics::TransportMetrics;
use crate::pool::Address;
use crate::tls::server_name;
use crate::transport::{EventSender, Transport, TransportContext, TransportEvent, TransportPayload};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Work for the socket task, in the order the endpoint issued it
pub(crate) enum Outgoing {
    Payload(TransportPayload),
    Ping,
}

/// Out-of-band requests from the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Drop the connection and report a failure, then reconnect
    Fail,
    /// Close the connection and finish
    Shutdown,
}

/// Why a connection attempt or session ended
enum Exit {
    Failed(TransportError),
    Shutdown,
}

/// Endpoint-side handle to a courier connection
pub struct CourierTransport {
    queue: mpsc::Sender<Outgoing>,
    control: mpsc::UnboundedSender<Control>,
    closing: CancellationToken,
}

impl CourierTransport {
    /// Start the socket task; the first connection attempt begins at once
    pub(crate) fn spawn(context: TransportContext, settings: Arc<CourierSettings>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_size);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();

        let worker = Worker {
            backoff: Backoff::new(settings.backoff_floor, settings.backoff_max),
            context,
            settings,
            queue: queue_rx,
            control: control_rx,
            closing: closing.clone(),
        };
        tokio::spawn(worker.run());

        Self {
            queue: queue_tx,
            control: control_tx,
            closing,
        }
    }

    /// Queue without waiting; a full queue is congestion, not failure
    fn enqueue(&self, item: Outgoing) -> Result<(), TransportError> {
        self.queue.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Congestion,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl Transport for CourierTransport {
    fn write(&mut self, payload: TransportPayload) -> Result<(), TransportError> {
        self.enqueue(Outgoing::Payload(payload))
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        self.enqueue(Outgoing::Ping)
    }

    fn fail(&mut self) {
        let _ = self.control.send(Control::Fail);
    }

    fn shutdown(&mut self) {
        self.closing.cancel();
        let _ = self.control.send(Control::Shutdown);
    }
}

/// Dropping the handle without `shutdown` still stops the task
impl Drop for CourierTransport {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

/// Owns the socket and reconnects until told to stop
struct Worker {
    context: TransportContext,
    settings: Arc<CourierSettings>,
    queue: mpsc::Receiver<Outgoing>,
    control: mpsc::UnboundedReceiver<Control>,
    /// Cancelled once shutdown is requested; stalled writes give up
    closing: CancellationToken,
    backoff: Backoff,
}

impl Worker {
    /// Session after session, with backoff between failures
    ///
    /// `Finished` is always the last event the endpoint sees.
    async fn run(mut self) {
        loop {
            match self.session().await {
                Exit::Shutdown => break,
                Exit::Failed(error) => {
                    tracing::warn!(
                        endpoint = %self.context.server,
                        error = %error,
                        "courier connection failed"
                    );
                    if !self.context.events.send(TransportEvent::failed(error)).await {
                        return;
                    }
                    if self.context.finish_on_fail {
                        break;
                    }
                    let wait = self.backoff.trigger();
                    if !self.wait(wait).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(endpoint = %self.context.server, "courier transport finished");
        self.context.events.send(TransportEvent::Finished).await;
    }

    /// Sleep out a backoff; false if shutdown was requested meanwhile
    async fn wait(&mut self, wait: Duration) -> bool {
        if !wait.is_zero() {
            tracing::info!(
                endpoint = %self.context.server,
                wait_secs = wait.as_secs_f64(),
                "reconnecting after backoff"
            );
        }
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Fail) => continue,
                    Some(Control::Shutdown) | None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// Connect, negotiate and serve until the connection ends
    async fn session(&mut self) -> Exit {
        let connected = tokio::select! {
            biased;
            control = self.control.recv() => return match control {
                Some(Control::Fail) => Exit::Failed(TransportError::Forced),
                Some(Control::Shutdown) | None => Exit::Shutdown,
            },
            connected = connect(&self.context, &self.settings) => connected,
        };

        match connected {
            Ok((Stream::Plain(stream), address)) => self.serve(stream, address).await,
            Ok((Stream::Tls(stream), address)) => self.serve(*stream, address).await,
            Err(e) => Exit::Failed(e),
        }
    }

    /// Negotiate, announce `Started`, then run the send and receive halves
    /// until either ends or a control request arrives
    async fn serve<S>(&mut self, stream: S, address: Address) -> Exit
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer = DeadlineWriter::new(writer, self.closing.clone());
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut decoder = FrameDecoder::new();

        let negotiated = timeout(
            self.settings.timeout,
            negotiate(&mut reader, &mut writer, &mut buf, &mut decoder),
        )
        .await;
        let supports_evnt = match negotiated {
            Ok(Ok(supports_evnt)) => supports_evnt,
            Ok(Err(e)) => return Exit::Failed(e),
            Err(_) => return Exit::Failed(TransportError::Timeout("protocol negotiation")),
        };

        // Anything queued belongs to the previous connection; the publisher
        // has already pulled those payloads back
        while self.queue.try_recv().is_ok() {}

        self.backoff.reset();
        tracing::info!(
            endpoint = %self.context.server,
            address = %address,
            evnt = supports_evnt,
            "courier connection established"
        );
        if !self.context.events.send(TransportEvent::Started).await {
            return Exit::Shutdown;
        }

        let result = tokio::select! {
            result = send_loop(&mut self.queue, &mut writer, supports_evnt, &self.context.metrics) => {
                match result {
                    Ok(()) => Exit::Shutdown,
                    Err(e) => Exit::Failed(e),
                }
            }
            result = receive_loop(&mut reader, &mut buf, &mut decoder, &self.context.events, &self.context.metrics) => {
                match result {
                    Ok(()) => Exit::Shutdown,
                    Err(e) => Exit::Failed(e),
                }
            }
            control = self.control.recv() => match control {
                Some(Control::Fail) => Exit::Failed(TransportError::Forced),
                Some(Control::Shutdown) | None => Exit::Shutdown,
            },
        };

        if matches!(result, Exit::Shutdown) {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(endpoint = %self.context.server, error = %e, "close failed");
            }
        }
        result
    }
}

/// A connected socket, with TLS when the endpoint is configured for it
enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Dial the pool's next address and run the TLS handshake if any
///
/// Each step gets the configured timeout of its own. SNI uses the
/// configured server name, else the host the address was resolved from.
async fn connect(
    context: &TransportContext,
    settings: &CourierSettings,
) -> Result<(Stream, Address), TransportError> {
    let address = context.pool.next().await?;
    tracing::debug!(endpoint = %context.server, address = %address, "connecting");

    let tcp = timeout(settings.timeout, TcpStream::connect(address.addr))
        .await
        .map_err(|_| TransportError::Timeout("connect"))?
        .map_err(|e| TransportError::connect(address.to_string(), e))?;
    configure_socket(&tcp);
    context.metrics.record_reconnect();

    let Some(tls) = &settings.tls else {
        return Ok((Stream::Plain(tcp), address));
    };

    let name = server_name(tls.server_name.as_deref().unwrap_or(&address.host))?;
    let connector = TlsConnector::from(Arc::clone(&tls.config));
    let stream = timeout(settings.timeout, connector.connect(name, tcp))
        .await
        .map_err(|_| TransportError::Timeout("TLS handshake"))??;

    Ok((Stream::Tls(Box::new(stream)), address))
}

/// Send `HELO` and wait for `VERS` or `????`; returns whether `EVNT` may be used
async fn negotiate<S, W>(
    reader: &mut ReadHalf<S>,
    writer: &mut DeadlineWriter<W>,
    buf: &mut BytesMut,
    decoder: &mut FrameDecoder,
) -> Result<bool, TransportError>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::new();
    encode(&Message::Helo(Handshake::current(true)), &mut frame)?;
    writer.write_all(&frame).await?;

    loop {
        match decoder.decode(buf)? {
            Some(Message::Vers(handshake)) => {
                tracing::debug!(
                    server = %handshake.ident_str(),
                    major = handshake.major,
                    minor = handshake.minor,
                    patch = handshake.patch,
                    "server version"
                );
                return Ok(handshake.supports_evnt());
            }
            Some(Message::Unknown) => {
                tracing::debug!("server does not support negotiation, using JDAT");
                return Ok(false);
            }
            Some(other) => return Err(TransportError::Unexpected(other.name())),
            None => {
                if reader.read_buf(buf).await? == 0 {
                    return Err(TransportError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
    }
}

/// Drain the send queue onto the socket; returns `Ok` when the handle is gone
async fn send_loop<W>(
    queue: &mut mpsc::Receiver<Outgoing>,
    writer: &mut DeadlineWriter<W>,
    supports_evnt: bool,
    metrics: &TransportMetrics,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::new();
    while let Some(item) = queue.recv().await {
        frame.clear();
        match item {
            Outgoing::Ping => {
                encode(&Message::Ping, &mut frame)?;
                writer.write_all(&frame).await?;
                tracing::trace!("sent PING");
            }
            Outgoing::Payload(payload) => {
                let compressed = payload.compressed()?;
                encode_data_frame(&payload.nonce, &compressed, supports_evnt, &mut frame)?;
                writer.write_all(&frame).await?;
                metrics.record_sent(frame.len() as u64);
                tracing::trace!(
                    nonce = %payload.nonce,
                    events = payload.len(),
                    bytes = frame.len(),
                    "sent payload"
                );
            }
        }
    }
    Ok(())
}

/// Read acks and pongs; any other message is a protocol error
async fn receive_loop<S>(
    reader: &mut ReadHalf<S>,
    buf: &mut BytesMut,
    decoder: &mut FrameDecoder,
    events: &EventSender,
    metrics: &TransportMetrics,
) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    loop {
        while let Some(message) = decoder.decode(buf)? {
            let event = match message {
                Message::Ack { nonce, sequence } => {
                    metrics.record_ack();
                    tracing::trace!(nonce = %nonce, sequence, "received ACKN");
                    TransportEvent::Ack { nonce, sequence }
                }
                Message::Pong => TransportEvent::Pong,
                other => return Err(TransportError::Unexpected(other.name())),
            };
            if !events.send(event).await {
                return Ok(());
            }
        }

        if reader.read_buf(buf).await? == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
    }
}
