//! Deadline-bounded writes
//!
//! A TLS session cannot recover from a write that was abandoned half way,
//! so instead of one long deadline each chunk gets a short one and the
//! write is retried until it completes or the connection is closing.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Per-chunk write deadline
pub(crate) const CHUNK_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct DeadlineWriter<W> {
    inner: W,
    chunk_timeout: Duration,
    closing: CancellationToken,
}

impl<W: AsyncWrite + Unpin> DeadlineWriter<W> {
    pub(crate) fn new(inner: W, closing: CancellationToken) -> Self {
        Self {
            inner,
            chunk_timeout: CHUNK_TIMEOUT,
            closing,
        }
    }

    /// Write all of `buf` and flush
    pub(crate) async fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match timeout(self.chunk_timeout, self.inner.write(buf)).await {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(e),
                Err(_) => self.check_closing()?,
            }
        }

        loop {
            match timeout(self.chunk_timeout, self.inner.flush()).await {
                Ok(result) => return result,
                Err(_) => self.check_closing()?,
            }
        }
    }

    /// Close the write direction so the peer sees EOF
    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match timeout(self.chunk_timeout, self.inner.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    fn check_closing(&self) -> io::Result<()> {
        if self.closing.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "connection closing during write",
            ));
        }
        tracing::trace!("write deadline passed, retrying");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_all_completes() {
        let (client, mut server) = tokio::io::duplex(16);
        let mut writer = DeadlineWriter::new(client, CancellationToken::new());

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            server.read_to_end(&mut out).await.unwrap();
            out
        });

        writer.write_all(&[7u8; 100]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        assert_eq!(reader.await.unwrap(), vec![7u8; 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_gives_up_when_closing() {
        let (client, _server) = tokio::io::duplex(4);
        let closing = CancellationToken::new();
        let mut writer = DeadlineWriter::new(client, closing.clone());

        let task = tokio::spawn(async move { writer.write_all(&[1u8; 64]).await });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!task.is_finished());

        closing.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
