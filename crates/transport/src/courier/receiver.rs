//! Courier receiver (server side)
//!
//! Each connection runs two halves joined by message passing:
//!
//! - the reader decodes frames, announces each new payload to the sender
//!   over a bounded channel and, once the sender has registered it, hands
//!   the payload to the application;
//! - the sender owns the write half and the in-flight table. It answers
//!   `HELO` and `PING`, writes application acks, and re-sends the current
//!   sequence of every in-flight payload every few seconds so a slow
//!   consumer does not trip the client's timeout.
//!
//! Explicit acks for a nonce are strictly increasing; requests that do not
//! advance are dropped. When the reader reaches EOF the sender keeps going
//! until every in-flight payload has been fully acknowledged, then closes
//! the write direction.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use courier_protocol::{Event, FrameDecoder, Handshake, Message, Nonce, encode};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::writer::DeadlineWriter;
use super::{MAX_IN_FLIGHT, PARTIAL_ACK_INTERVAL, configure_socket};
use crate::error::TransportError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Acknowledges payloads received on one connection
#[derive(Clone, Debug)]
pub struct Acker {
    tx: mpsc::UnboundedSender<(Nonce, u32)>,
}

impl Acker {
    /// Report the first `sequence` events of `nonce` as processed
    ///
    /// Returns false if the connection has gone away.
    pub fn ack(&self, nonce: Nonce, sequence: u32) -> bool {
        self.tx.send((nonce, sequence)).is_ok()
    }
}

/// A payload delivered by a client
#[derive(Debug)]
pub struct ReceivedPayload {
    pub peer: SocketAddr,
    pub nonce: Nonce,
    pub events: Vec<Event>,
    pub acker: Acker,
}

impl ReceivedPayload {
    /// Acknowledge every event in the payload
    pub fn ack_all(&self) -> bool {
        self.acker.ack(self.nonce, self.events.len() as u32)
    }
}

/// Messages from the reader half to the sender half
enum Inbound {
    Hello,
    Ping,
    /// `registered` fires once acks for `nonce` will be accepted
    Payload {
        nonce: Nonce,
        count: u32,
        registered: oneshot::Sender<()>,
    },
}

struct InFlight {
    count: u32,
    /// Highest sequence written for this nonce
    sent: Option<u32>,
    /// Highest sequence requested by the application
    acked: u32,
    keepalive_at: Instant,
}

/// Accepts courier connections and yields their payloads
pub struct CourierReceiver {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    payloads: mpsc::Sender<ReceivedPayload>,
    keepalive: Duration,
}

impl CourierReceiver {
    /// Bind the listener
    ///
    /// Payloads arrive on the returned channel; `capacity` bounds how many
    /// may wait for the application before connections stop reading.
    pub async fn bind(
        address: &str,
        tls: Option<Arc<ServerConfig>>,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<ReceivedPayload>), TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::connect(address, e))?;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        Ok((
            Self {
                listener,
                acceptor: tls.map(TlsAcceptor::from),
                payloads: tx,
                keepalive: PARTIAL_ACK_INTERVAL,
            },
            rx,
        ))
    }

    /// Override the partial-ack interval
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        tracing::info!(
            address = %self.local_addr()?,
            tls = self.acceptor.is_some(),
            "courier receiver listening"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            peer,
                            payloads: self.payloads.clone(),
                            keepalive: self.keepalive,
                            cancel: cancel.child_token(),
                        };
                        let acceptor = self.acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = connection.accept(stream, acceptor).await {
                                tracing::info!(peer = %peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept error"),
                }
            }
        }

        tracing::info!("courier receiver stopped");
        Ok(())
    }
}

struct Connection {
    peer: SocketAddr,
    payloads: mpsc::Sender<ReceivedPayload>,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl Connection {
    async fn accept(
        self,
        stream: TcpStream,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<(), TransportError> {
        configure_socket(&stream);
        tracing::debug!(peer = %self.peer, "connection accepted");

        match acceptor {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                self.serve(stream).await
            }
            None => self.serve(stream).await,
        }
    }

    async fn serve<S>(self, stream: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(MAX_IN_FLIGHT);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let sender = Sender {
            writer: DeadlineWriter::new(writer, self.cancel.clone()),
            inbound: inbound_rx,
            acks: ack_rx,
            in_flight: HashMap::new(),
            keepalive: self.keepalive,
            peer: self.peer,
        };
        let cancel = self.cancel.clone();
        let sender_task = tokio::spawn(async move {
            let result = sender.run().await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        });

        let acker = Acker { tx: ack_tx };
        let read_result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.read_loop(&mut reader, &inbound_tx, acker) => result,
        };
        drop(inbound_tx);

        let send_result = match sender_task.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Io(io::Error::other(e))),
        };
        read_result.and(send_result)
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        inbound: &mpsc::Sender<Inbound>,
        acker: Acker,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut decoder = FrameDecoder::new();

        loop {
            while let Some(message) = decoder.decode(&mut buf)? {
                let inbound_message = match message {
                    Message::Helo(handshake) => {
                        tracing::debug!(
                            peer = %self.peer,
                            client = %handshake.ident_str(),
                            evnt = handshake.supports_evnt(),
                            "client hello"
                        );
                        Inbound::Hello
                    }
                    Message::Ping => Inbound::Ping,
                    // Legacy clients send data without a handshake
                    Message::Jdat { nonce, events } | Message::Evnt { nonce, events } => {
                        let events = events
                            .into_iter()
                            .map(Event::decode)
                            .collect::<Result<Vec<_>, _>>()?;
                        let count = events.len() as u32;
                        let (registered, wait) = oneshot::channel();
                        let announce = Inbound::Payload { nonce, count, registered };
                        if inbound.send(announce).await.is_err() {
                            return Ok(());
                        }
                        // The application may ack as soon as it sees the
                        // payload, so the sender must know the nonce first
                        if wait.await.is_err() {
                            return Ok(());
                        }
                        let payload = ReceivedPayload {
                            peer: self.peer,
                            nonce,
                            events,
                            acker: acker.clone(),
                        };
                        if self.payloads.send(payload).await.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                    other => return Err(TransportError::Unexpected(other.name())),
                };
                if inbound.send(inbound_message).await.is_err() {
                    return Ok(());
                }
            }

            if reader.read_buf(&mut buf).await? == 0 {
                if decoder.in_stream() || !buf.is_empty() {
                    return Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                tracing::debug!(peer = %self.peer, "client closed connection");
                return Ok(());
            }
        }
    }
}

struct Sender<W> {
    writer: DeadlineWriter<WriteHalf<W>>,
    inbound: mpsc::Receiver<Inbound>,
    acks: mpsc::UnboundedReceiver<(Nonce, u32)>,
    in_flight: HashMap<Nonce, InFlight>,
    keepalive: Duration,
    peer: SocketAddr,
}

impl<W: AsyncWrite + Unpin> Sender<W> {
    async fn run(mut self) -> Result<(), TransportError> {
        let mut reader_done = false;
        let mut frame = BytesMut::new();

        loop {
            if reader_done && self.in_flight.is_empty() {
                break;
            }

            let next_keepalive = self.in_flight.values().map(|f| f.keepalive_at).min();
            let can_accept = !reader_done && self.in_flight.len() < MAX_IN_FLIGHT;

            tokio::select! {
                inbound = self.inbound.recv(), if can_accept => match inbound {
                    Some(Inbound::Hello) => {
                        frame.clear();
                        encode(&Message::Vers(Handshake::current(true)), &mut frame)?;
                        self.writer.write_all(&frame).await?;
                    }
                    Some(Inbound::Ping) => {
                        if !self.in_flight.is_empty() {
                            return Err(TransportError::Unexpected("PING with payloads in flight"));
                        }
                        frame.clear();
                        encode(&Message::Pong, &mut frame)?;
                        self.writer.write_all(&frame).await?;
                    }
                    Some(Inbound::Payload { nonce, count, registered }) => {
                        self.in_flight.insert(nonce, InFlight {
                            count,
                            sent: None,
                            acked: 0,
                            keepalive_at: Instant::now() + self.keepalive,
                        });
                        let _ = registered.send(());
                    }
                    None => reader_done = true,
                },
                ack = self.acks.recv() => match ack {
                    Some((nonce, sequence)) => self.explicit_ack(nonce, sequence, &mut frame).await?,
                    // Reader finished and the application dropped every payload
                    None => {
                        if !self.in_flight.is_empty() {
                            tracing::warn!(
                                peer = %self.peer,
                                in_flight = self.in_flight.len(),
                                "payloads dropped without acknowledgement"
                            );
                        }
                        break;
                    }
                },
                _ = sleep_until(next_keepalive.unwrap_or_else(Instant::now)), if next_keepalive.is_some() => {
                    self.partial_acks(&mut frame).await?;
                }
            }
        }

        self.writer.shutdown().await?;
        tracing::debug!(peer = %self.peer, "acks flushed, write side closed");
        Ok(())
    }

    async fn explicit_ack(
        &mut self,
        nonce: Nonce,
        sequence: u32,
        frame: &mut BytesMut,
    ) -> Result<(), TransportError> {
        let Some(entry) = self.in_flight.get_mut(&nonce) else {
            tracing::debug!(peer = %self.peer, nonce = %nonce, "ack for unknown nonce dropped");
            return Ok(());
        };

        let sequence = sequence.min(entry.count);
        if entry.sent.is_some_and(|sent| sequence <= sent) {
            return Ok(());
        }
        entry.acked = sequence;
        entry.sent = Some(sequence);
        entry.keepalive_at = Instant::now() + self.keepalive;
        let complete = sequence >= entry.count;

        frame.clear();
        encode(&Message::Ack { nonce, sequence }, frame)?;
        self.writer.write_all(frame).await?;
        tracing::trace!(peer = %self.peer, nonce = %nonce, sequence, "sent ACKN");

        if complete {
            self.in_flight.remove(&nonce);
        }
        Ok(())
    }

    /// Re-send the current sequence of every payload whose keepalive is due
    async fn partial_acks(&mut self, frame: &mut BytesMut) -> Result<(), TransportError> {
        let now = Instant::now();
        frame.clear();
        for (nonce, entry) in self.in_flight.iter_mut() {
            if entry.keepalive_at > now {
                continue;
            }
            encode(
                &Message::Ack {
                    nonce: *nonce,
                    sequence: entry.acked,
                },
                frame,
            )?;
            entry.sent = Some(entry.acked);
            entry.keepalive_at = now + self.keepalive;
        }
        if !frame.is_empty() {
            self.writer.write_all(frame).await?;
            tracing::trace!(peer = %self.peer, "sent partial acks");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "receiver_test.rs"]
mod receiver_test;
