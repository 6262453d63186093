//! Publish command - ship stdin lines through the publisher
//!
//! Lines are grouped into batches of up to `--batch-size` events; a partial
//! batch is flushed after `--flush-interval-ms` without input. On EOF the
//! publisher drains what it has accepted and exits. SIGHUP re-reads the
//! configuration file and hands the new `[network]` section to the
//! publisher.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use courier_config::{Config, NetworkConfig};
use courier_protocol::Event;
use courier_publisher::{LogRegistrar, Publisher};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SOURCE: &str = "stdin";

/// Publish command arguments
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Maximum events per batch
    #[arg(short, long, default_value_t = 1024)]
    pub batch_size: usize,

    /// Flush a partial batch after this long without input
    #[arg(long, default_value_t = 1000)]
    pub flush_interval_ms: u64,

    /// Servers to publish to, replacing `network.servers`
    #[arg(short, long = "server")]
    pub servers: Vec<String>,
}

/// Run the publish command
pub async fn run(args: PublishArgs, config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let network = network_config(&config, &args.servers)?;
    let publisher = Publisher::builder(network)
        .registrar(LogRegistrar::default())
        .build()
        .context("failed to start publisher")?;

    let (spool_tx, spool_rx) = mpsc::channel(1);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let mut publisher_task = tokio::spawn(publisher.run(spool_rx, reload_rx, cancel.clone()));

    #[cfg(unix)]
    if let Some(path) = config_path {
        tokio::spawn(reload_on_hangup(
            path,
            args.servers.clone(),
            reload_tx,
            cancel.clone(),
        ));
    }
    #[cfg(not(unix))]
    drop((config_path, reload_tx));

    let reader = tokio::spawn(read_stdin(
        args.batch_size.max(1),
        Duration::from_millis(args.flush_interval_ms),
        spool_tx,
        cancel.clone(),
    ));

    tokio::select! {
        _ = super::wait_for_shutdown() => {
            info!("shutdown signal received, stopping publisher...");
            cancel.cancel();
            publisher_task.await.context("publisher task failed")?;
        }
        result = &mut publisher_task => {
            result.context("publisher task failed")?;
            cancel.cancel();
        }
    }

    reader.await.context("stdin reader task failed")??;
    info!("publisher stopped");
    Ok(())
}

/// The `[network]` section, with servers from the command line taking over
fn network_config(config: &Config, servers: &[String]) -> Result<NetworkConfig> {
    let mut network = match (&config.network, servers.is_empty()) {
        (Some(network), _) => network.clone(),
        (None, false) => NetworkConfig::default(),
        (None, true) => anyhow::bail!("no [network] section in configuration and no --server given"),
    };
    if !servers.is_empty() {
        network.servers = servers.to_vec();
    }
    Ok(network)
}

async fn read_stdin(
    batch_size: usize,
    flush_interval: Duration,
    spool: mpsc::Sender<Vec<Event>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batcher = LineBatcher::new(batch_size);

    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(flush_interval), if !batcher.is_empty() => batcher.take(),
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => batcher.push(line),
                None => break,
            },
        };

        if let Some(batch) = ready
            && !send(&spool, batch, &cancel).await
        {
            return Ok(());
        }
    }

    if let Some(batch) = batcher.take() {
        send(&spool, batch, &cancel).await;
    }
    info!(lines = batcher.lines, "end of input");
    Ok(())
}

/// Hand a batch to the publisher; false once the publisher is gone
async fn send(spool: &mpsc::Sender<Vec<Event>>, batch: Vec<Event>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        result = spool.send(batch) => result.is_ok(),
    }
}

#[cfg(unix)]
async fn reload_on_hangup(
    path: PathBuf,
    servers: Vec<String>,
    reload: mpsc::Sender<NetworkConfig>,
    cancel: CancellationToken,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, reload disabled");
            return;
        }
    };
    info!(path = %path.display(), "SIGHUP handler installed for configuration reload");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = hangup.recv() => if received.is_none() { return },
        }

        let network = Config::from_file(&path)
            .map_err(anyhow::Error::from)
            .and_then(|config| network_config(&config, &servers));
        match network {
            Ok(network) => {
                info!(path = %path.display(), "SIGHUP: reloading configuration");
                if reload.send(network).await.is_err() {
                    return;
                }
            }
            Err(e) => error!(error = %e, "SIGHUP: failed to reload configuration"),
        }
    }
}

/// Groups input lines into event batches
///
/// The offset of each event is the byte position just past its line, so a
/// committed offset is where reading would resume.
struct LineBatcher {
    size: usize,
    batch: Vec<Event>,
    position: u64,
    lines: u64,
}

impl LineBatcher {
    fn new(size: usize) -> Self {
        Self {
            size,
            batch: Vec::with_capacity(size),
            position: 0,
            lines: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Add a line, returning the batch once it is full
    fn push(&mut self, line: String) -> Option<Vec<Event>> {
        self.position += line.len() as u64 + 1;
        self.lines += 1;
        self.batch.push(
            Event::builder(line)
                .source(SOURCE)
                .offset(self.position)
                .build(),
        );
        if self.batch.len() >= self.size {
            self.take()
        } else {
            None
        }
    }

    fn take(&mut self) -> Option<Vec<Event>> {
        if self.batch.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.size),
        ))
    }
}
