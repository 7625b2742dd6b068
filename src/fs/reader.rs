//! Fault-tolerant read cursor over a remote file.
//!
//! [`FtReader`] tracks the logical offset on its own and transparently
//! reopens + seeks when the underlying stream dies mid-read. A failure to
//! seek after a reopen is fatal: the stream position can no longer be
//! trusted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::fs::dfs::{DfsClient, DfsReader};
use crate::fs::error::FsError;
use crate::fs::retry::RetryPolicy;

/// Lock-free counters for read-path diagnostics.
#[derive(Debug, Default)]
pub struct ReaderStats {
    reads: AtomicU64,
    seeks: AtomicU64,
    reopens: AtomicU64,
}

impl ReaderStats {
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reopen(&self) {
        self.reopens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    pub fn reopens(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }
}

pub struct FtReader {
    path: String,
    client: Arc<dyn DfsClient>,
    policy: Arc<RetryPolicy>,
    inner: Option<Box<dyn DfsReader>>,
    offset: u64,
    stats: Arc<ReaderStats>,
}

impl FtReader {
    /// A reader that opens its stream lazily on first read.
    pub fn new(path: impl Into<String>, client: Arc<dyn DfsClient>, policy: Arc<RetryPolicy>) -> Self {
        Self {
            path: path.into(),
            client,
            policy,
            inner: None,
            offset: 0,
            stats: Arc::new(ReaderStats::default()),
        }
    }

    /// Wrap an already-open stream positioned at offset 0.
    pub fn with_stream(
        stream: Box<dyn DfsReader>,
        path: impl Into<String>,
        client: Arc<dyn DfsClient>,
        policy: Arc<RetryPolicy>,
    ) -> Self {
        Self {
            path: path.into(),
            client,
            policy,
            inner: Some(stream),
            offset: 0,
            stats: Arc::new(ReaderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReaderStats> {
        self.stats.clone()
    }

    async fn drop_inner(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            let _ = inner.close().await;
        }
    }
}

#[async_trait]
impl DfsReader for FtReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut op = self.policy.start_operation();
        loop {
            if self.inner.is_none() {
                match self.client.open_read(&self.path).await {
                    Ok(mut stream) => {
                        self.stats.record_reopen();
                        if let Err(e) = stream.seek(self.offset).await {
                            // A reopened stream we cannot position is useless.
                            warn!(path = %self.path, offset = self.offset, error = %e,
                                "seek after reopen failed");
                            let _ = stream.close().await;
                            return Err(e);
                        }
                        self.inner = Some(stream);
                    }
                    Err(e) => {
                        if op.should_retry("OpenRead", &e).await {
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            let inner = self.inner.as_mut().unwrap_or_else(|| unreachable!());
            match inner.read(buf).await {
                Ok(n) => {
                    self.offset += n as u64;
                    self.stats.record_read();
                    return Ok(n);
                }
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    if !op.should_retry("Read", &e).await {
                        return Err(e);
                    }
                    debug!(path = %self.path, offset = self.offset,
                        "read failed, reopening stream");
                    if let Some(mut inner) = self.inner.take() {
                        let _ = inner.close().await;
                    }
                }
            }
        }
    }

    async fn seek(&mut self, pos: u64) -> Result<(), FsError> {
        self.stats.record_seek();
        if let Some(inner) = self.inner.as_mut() {
            // Errors here are non-recoverable and propagate right away.
            inner.seek(pos).await?;
        }
        self.offset = pos;
        Ok(())
    }

    async fn position(&mut self) -> Result<u64, FsError> {
        // Tracked locally; no RPC.
        Ok(self.offset)
    }

    async fn close(&mut self) -> Result<(), FsError> {
        debug!(path = %self.path, reads = self.stats.reads(), seeks = self.stats.seeks(),
            reopens = self.stats.reopens(), "closing reader");
        self.drop_inner().await;
        Ok(())
    }
}
