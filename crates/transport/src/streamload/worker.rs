//! Stream-load controller and load workers
//!
//! The controller prepares the schema once per session, then runs
//! `routines` workers that share the endpoint's payload queue. A payload
//! is acknowledged only after every table it touches has loaded, so one
//! worker's failure ends the session and the publisher resends the rest.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::body::encode_body;
use super::client::{LoadRequest, send_load};
use super::error::StreamLoadError;
use super::schema::{DEFAULT_METADATA_PORT, TableManager};
use super::table::TableTarget;
use super::StreamLoadSettings;
use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::pool::Address;
use crate::transport::{Transport, TransportContext, TransportEvent, TransportPayload};

/// Shortest wait between retries of one load
const MIN_RETRY: Duration = Duration::from_secs(1);

/// Requests from the endpoint; a ping is answered by the controller itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Ping,
    Fail,
    Shutdown,
}

enum Exit {
    /// `fatal` failures are reported once and never retried
    Failed { error: TransportError, fatal: bool },
    Shutdown,
}

impl Exit {
    fn failed(error: TransportError) -> Self {
        Self::Failed { error, fatal: false }
    }
}

/// Workers take turns receiving from the one queue
type PayloadQueue = Arc<Mutex<mpsc::Receiver<TransportPayload>>>;

/// Endpoint-side handle to a stream-load controller
pub struct StreamLoadTransport {
    queue: mpsc::Sender<TransportPayload>,
    control: mpsc::UnboundedSender<Control>,
    closing: CancellationToken,
}

impl StreamLoadTransport {
    /// Start the controller; workers begin once the schema is ready
    pub(crate) fn spawn(context: TransportContext, settings: Arc<StreamLoadSettings>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_size);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();

        let controller = Controller {
            backoff: Backoff::new(settings.backoff_floor, settings.backoff_max),
            context,
            settings,
            queue: Arc::new(Mutex::new(queue_rx)),
            control: control_rx,
            closing: closing.clone(),
            tables: None,
        };
        tokio::spawn(controller.run());

        Self {
            queue: queue_tx,
            control: control_tx,
            closing,
        }
    }
}

impl Transport for StreamLoadTransport {
    fn write(&mut self, payload: TransportPayload) -> Result<(), TransportError> {
        self.queue.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Congestion,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn ping(&mut self) -> Result<(), TransportError> {
        self.control
            .send(Control::Ping)
            .map_err(|_| TransportError::Closed)
    }

    fn fail(&mut self) {
        let _ = self.control.send(Control::Fail);
    }

    fn shutdown(&mut self) {
        self.closing.cancel();
        let _ = self.control.send(Control::Shutdown);
    }
}

impl Drop for StreamLoadTransport {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

/// Supervises one endpoint's workers across sessions
struct Controller {
    context: TransportContext,
    settings: Arc<StreamLoadSettings>,
    queue: PayloadQueue,
    control: mpsc::UnboundedReceiver<Control>,
    closing: CancellationToken,
    backoff: Backoff,
    /// Kept across sessions so known tables are not looked up again
    tables: Option<Arc<TableManager>>,
}

impl Controller {
    async fn run(mut self) {
        loop {
            match self.session().await {
                Exit::Shutdown => break,
                Exit::Failed { error, fatal } => {
                    if fatal {
                        tracing::error!(endpoint = %self.context.server, error = %error, "stream-load endpoint failed permanently");
                    } else {
                        tracing::warn!(endpoint = %self.context.server, error = %error, "stream-load endpoint failed");
                    }
                    let event = TransportEvent::Failed { error, fatal };
                    if !self.context.events.send(event).await {
                        return;
                    }
                    if fatal || self.context.finish_on_fail {
                        break;
                    }
                    let wait = self.backoff.trigger();
                    if !self.wait(wait).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(endpoint = %self.context.server, "stream-load transport finished");
        self.context.events.send(TransportEvent::Finished).await;
    }

    /// Sleep out a backoff; false if shutdown was requested meanwhile
    async fn wait(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Ping | Control::Fail) => continue,
                    Some(Control::Shutdown) | None => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// Prepare the schema, start the workers and supervise them
    async fn session(&mut self) -> Exit {
        let generation = self.closing.child_token();

        let tables = match self.table_manager().await {
            Ok(tables) => tables,
            Err(e) => return Exit::failed(e),
        };

        if let TableTarget::Static(table) = &self.settings.target {
            let ensure = tables.ensure(table, &generation);
            tokio::pin!(ensure);
            let result = loop {
                tokio::select! {
                    result = &mut ensure => break result,
                    control = self.control.recv() => match control {
                        Some(Control::Ping) => continue,
                        Some(Control::Fail) => return Exit::failed(TransportError::Forced),
                        Some(Control::Shutdown) | None => return Exit::Shutdown,
                    },
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    return Exit::Failed {
                        error: StreamLoadError::from(e).into(),
                        fatal: true,
                    };
                }
                Err(_) => return Exit::Shutdown,
            }
        }

        // Anything still queued was pulled back by the publisher when the
        // previous session failed
        {
            let mut queue = self.queue.lock().await;
            while queue.try_recv().is_ok() {}
        }

        self.backoff.reset();
        tracing::info!(
            endpoint = %self.context.server,
            routines = self.settings.config.routines,
            "stream-load endpoint ready"
        );
        if !self.context.events.send(TransportEvent::Started).await {
            return Exit::Shutdown;
        }

        let (failures_tx, mut failures) = mpsc::channel(1);
        let mut workers = JoinSet::new();
        for id in 0..self.settings.config.routines.max(1) {
            let worker = Worker {
                id,
                context: self.context.clone(),
                settings: Arc::clone(&self.settings),
                queue: Arc::clone(&self.queue),
                tables: Arc::clone(&tables),
                cancel: generation.clone(),
                failures: failures_tx.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(failures_tx);

        let exit = loop {
            tokio::select! {
                control = self.control.recv() => match control {
                    Some(Control::Ping) => {
                        if !self.context.events.send(TransportEvent::Pong).await {
                            break Exit::Shutdown;
                        }
                    }
                    Some(Control::Fail) => break Exit::failed(TransportError::Forced),
                    Some(Control::Shutdown) | None => break Exit::Shutdown,
                },
                Some(error) = failures.recv() => {
                    let fatal = error.is_fatal();
                    break Exit::Failed { error: error.into(), fatal };
                }
            }
        };

        generation.cancel();
        while workers.join_next().await.is_some() {}
        exit
    }

    /// Table manager for this endpoint, built on first use
    ///
    /// Without configured metadata servers the endpoint's own host is
    /// asked on the MySQL-protocol port.
    async fn table_manager(&mut self) -> Result<Arc<TableManager>, TransportError> {
        if let Some(tables) = &self.tables {
            return Ok(Arc::clone(tables));
        }

        let config = &self.settings.config;
        let servers = if config.metadata_servers.is_empty() {
            let address = self.context.pool.next().await?;
            vec![host_port(&address.host, DEFAULT_METADATA_PORT)]
        } else {
            config.metadata_servers.clone()
        };
        tracing::debug!(endpoint = %self.context.server, servers = ?servers, "metadata servers");

        let tables = Arc::new(TableManager::new(
            Arc::clone(&self.settings.schema),
            servers,
            config,
            self.settings.backoff_max,
        ));
        self.tables = Some(Arc::clone(&tables));
        Ok(tables)
    }
}

/// `host:port`, bracketing IPv6 literals
fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// One load routine; exits on cancellation or after reporting a failure
struct Worker {
    id: usize,
    context: TransportContext,
    settings: Arc<StreamLoadSettings>,
    queue: PayloadQueue,
    tables: Arc<TableManager>,
    cancel: CancellationToken,
    failures: mpsc::Sender<StreamLoadError>,
}

impl Worker {
    async fn run(self) {
        while let Some(payload) = self.next_payload().await {
            match self.deliver(&payload).await {
                Ok(()) => {
                    self.context.metrics.record_ack();
                    let ack = TransportEvent::Ack {
                        nonce: payload.nonce,
                        sequence: payload.len() as u32,
                    };
                    if !self.context.events.send(ack).await {
                        return;
                    }
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => {
                    let _ = self.failures.send(e).await;
                    return;
                }
            }
        }
    }

    /// Next payload from the shared queue, or `None` once cancelled
    async fn next_payload(&self) -> Option<TransportPayload> {
        let mut queue = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            payload = queue.recv() => payload,
        }
    }

    /// Load every event of the payload, retrying each table until it succeeds
    async fn deliver(&self, payload: &TransportPayload) -> Result<(), StreamLoadError> {
        let config = &self.settings.config;
        let events = payload.events();

        for (table, indices) in self.settings.target.group(events) {
            self.tables.ensure(&table, &self.cancel).await?;

            let body = encode_body(
                indices.iter().map(|&i| &events[i]),
                &config.columns,
                &config.rest_column,
            )?;
            let label = format!("{}-{}-{}", config.label_prefix, table, payload.nonce.to_hex());

            let mut backoff = Backoff::new(self.settings.backoff_floor.max(MIN_RETRY), self.settings.backoff_max);
            loop {
                let attempt = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StreamLoadError::Cancelled),
                    attempt = self.load(&table, &label, body.clone()) => attempt,
                };
                match attempt {
                    Ok(()) => {
                        self.context.metrics.record_sent(body.len() as u64);
                        break;
                    }
                    Err(e) => {
                        let wait = backoff.trigger();
                        tracing::error!(
                            endpoint = %self.context.server,
                            worker = self.id,
                            table = %table,
                            label = %label,
                            error = %e,
                            retry_secs = wait.as_secs_f64(),
                            "stream load failed"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(StreamLoadError::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// One load attempt against the pool's next address
    ///
    /// The label is stable across retries so a load the server already
    /// committed is reported as done instead of loaded twice.
    async fn load(&self, table: &str, label: &str, body: Bytes) -> Result<(), StreamLoadError> {
        let config = &self.settings.config;
        let address = self.context.pool.next().await?;
        let client = self.settings.clients.get(&address)?;

        let request = LoadRequest {
            url: load_url(config.scheme.as_str(), &address, &config.database, table)?,
            table,
            label: label.to_string(),
            body,
            properties: &self.settings.properties,
            username: config.username.as_deref(),
            password: config.password.as_deref(),
        };

        let response = send_load(&self.settings.clients, client, &request).await?;
        tracing::debug!(
            endpoint = %self.context.server,
            table = %table,
            label = %label,
            txn_id = response.txn_id,
            loaded = response.number_loaded_rows,
            filtered = response.number_filtered_rows,
            load_ms = response.load_time_ms,
            "stream load complete"
        );
        if response.number_filtered_rows > 0 {
            tracing::warn!(
                table = %table,
                filtered = response.number_filtered_rows,
                error_url = %response.error_url,
                "rows filtered during load"
            );
        }
        Ok(())
    }
}

/// `PUT` target for a load into `database.table` on `address`
pub(crate) fn load_url(
    scheme: &str,
    address: &Address,
    database: &str,
    table: &str,
) -> Result<Url, StreamLoadError> {
    let authority = host_port(&address.host, address.addr.port());
    Url::parse(&format!("{scheme}://{authority}/api/{database}/{table}/_stream_load"))
        .map_err(|e| StreamLoadError::InvalidUrl(e.to_string()))
}
