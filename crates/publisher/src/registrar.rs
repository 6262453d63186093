//! Registrar sink
//!
//! The registrar persists how far each source has been delivered. The
//! publisher hands it commits strictly in payload submission order and
//! calls [`Registrar::flush`] after each batch of commits.

use tokio::sync::mpsc;

use crate::payload::{PayloadKey, Rollup};

/// Acknowledged progress of one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub payload: PayloadKey,
    pub rollup: Rollup,
}

pub trait Registrar: Send {
    fn commit(&mut self, commit: Commit);

    /// Persist what has been committed so far
    fn flush(&mut self) {}
}

impl Registrar for mpsc::UnboundedSender<Commit> {
    fn commit(&mut self, commit: Commit) {
        if self.send(commit).is_err() {
            tracing::warn!("registrar channel closed, dropping commit");
        }
    }
}

/// Registrar that only logs commits
#[derive(Debug, Default)]
pub struct LogRegistrar {
    pending: usize,
}

impl Registrar for LogRegistrar {
    fn commit(&mut self, commit: Commit) {
        self.pending += commit.rollup.lines;
        for offset in &commit.rollup.offsets {
            tracing::debug!(
                payload = commit.payload,
                source = %offset.source,
                offset = offset.offset,
                "offset committed"
            );
        }
    }

    fn flush(&mut self) {
        if self.pending > 0 {
            tracing::info!(lines = self.pending, "commits flushed");
            self.pending = 0;
        }
    }
}
