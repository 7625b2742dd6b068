//! Pooled random access over one remote file.
//!
//! Positional reads from concurrent handles would otherwise fight over a
//! single cursor. The pool keys idle readers by their position, so a
//! sequential scan of adjacent chunks keeps landing on the same reader and
//! pays for no extra seeks, while disjoint readers coexist up to
//! `max_readers`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::fs::dfs::DfsReader;
use crate::fs::error::FsError;

const MAX_POOLED_READERS: usize = 256;

/// Opens fresh read cursors for the pooled file.
#[async_trait]
pub trait ReaderFactory: Send + Sync {
    async fn open_reader(&self) -> Result<Box<dyn DfsReader>, FsError>;
}

pub struct ReaderPool {
    factory: Box<dyn ReaderFactory>,
    /// Idle readers keyed by position. `None` once the pool is closed.
    idle: Mutex<Option<HashMap<u64, Box<dyn DfsReader>>>>,
    max_readers: usize,
}

impl ReaderPool {
    pub fn new(factory: Box<dyn ReaderFactory>) -> Self {
        Self {
            factory,
            idle: Mutex::new(Some(HashMap::new())),
            max_readers: MAX_POOLED_READERS,
        }
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; a short count or 0 means end of file was reached.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let mut reader = self.checkout(offset).await?;

        let result = Self::positioned_read(reader.as_mut(), buf, offset).await;
        match result {
            Ok(n) => {
                self.checkin(reader).await;
                Ok(n)
            }
            Err(e) => {
                let _ = reader.close().await;
                Err(e)
            }
        }
    }

    async fn positioned_read(
        reader: &mut dyn DfsReader,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, FsError> {
        if reader.position().await? != offset {
            reader.seek(offset).await?;
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break; // EOF with whatever we have is not an error
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Take the reader parked at `offset`, or any idle reader, or open a new
    /// one.
    async fn checkout(&self, offset: u64) -> Result<Box<dyn DfsReader>, FsError> {
        {
            let mut guard = self.idle.lock().await;
            let pool = guard.as_mut().ok_or(FsError::BadHandle)?;
            if let Some(reader) = pool.remove(&offset) {
                return Ok(reader);
            }
            if let Some(&key) = pool.keys().next() {
                debug!(want = offset, got = key, "no reader at position, reusing another");
                return Ok(pool.remove(&key).unwrap_or_else(|| unreachable!()));
            }
        }
        self.factory.open_reader().await
    }

    async fn checkin(&self, mut reader: Box<dyn DfsReader>) {
        let position = match reader.position().await {
            Ok(p) => p,
            Err(_) => {
                let _ = reader.close().await;
                return;
            }
        };

        let displaced = {
            let mut guard = self.idle.lock().await;
            match guard.as_mut() {
                Some(pool) if pool.len() < self.max_readers => {
                    // A reader already parked at this position is replaced.
                    pool.insert(position, reader)
                }
                _ => Some(reader), // closed or full: discard
            }
        };
        if let Some(mut old) = displaced {
            let _ = old.close().await;
        }
    }

    /// Close every pooled reader. Subsequent reads fail with `BadHandle`.
    pub async fn close(&self) {
        let drained = self.idle.lock().await.take();
        if let Some(pool) = drained {
            for (_, mut reader) in pool {
                let _ = reader.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    /// Deterministic pseudo-random content: byte at `i` is a mix of `i`.
    fn content_byte(i: u64) -> u8 {
        (i.wrapping_mul(31).wrapping_add(17) % 251) as u8
    }

    struct PseudoRandomReader {
        size: u64,
        pos: u64,
    }

    #[async_trait]
    impl DfsReader for PseudoRandomReader {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
            if self.pos >= self.size {
                return Ok(0);
            }
            let n = buf.len().min((self.size - self.pos) as usize);
            for (i, b) in buf[..n].iter_mut().enumerate() {
                *b = content_byte(self.pos + i as u64);
            }
            self.pos += n as u64;
            Ok(n)
        }
        async fn seek(&mut self, pos: u64) -> Result<(), FsError> {
            self.pos = pos;
            Ok(())
        }
        async fn position(&mut self) -> Result<u64, FsError> {
            Ok(self.pos)
        }
        async fn close(&mut self) -> Result<(), FsError> {
            Ok(())
        }
    }

    struct CountingFactory {
        size: u64,
        opened: Arc<SyncMutex<u32>>,
    }

    #[async_trait]
    impl ReaderFactory for CountingFactory {
        async fn open_reader(&self) -> Result<Box<dyn DfsReader>, FsError> {
            *self.opened.lock() += 1;
            Ok(Box::new(PseudoRandomReader {
                size: self.size,
                pos: 0,
            }))
        }
    }

    fn pool(size: u64) -> (ReaderPool, Arc<SyncMutex<u32>>) {
        let opened = Arc::new(SyncMutex::new(0));
        let pool = ReaderPool::new(Box::new(CountingFactory {
            size,
            opened: opened.clone(),
        }));
        (pool, opened)
    }

    #[tokio::test]
    async fn sequential_chunks_reuse_one_reader() {
        let (pool, opened) = pool(1 << 16);
        let mut buf = [0u8; 4096];
        for chunk in 0..8u64 {
            let off = chunk * 4096;
            assert_eq!(pool.read_at(&mut buf, off).await.unwrap(), 4096);
            assert_eq!(buf[0], content_byte(off));
        }
        assert_eq!(*opened.lock(), 1, "adjacent reads must share a cursor");
    }

    #[tokio::test]
    async fn random_offsets_match_seek_read() {
        let size = 1 << 20;
        let (pool, _) = pool(size);
        // A few "random" offsets, including ones near EOF.
        for &off in &[0u64, 1, 511, 4096, 65_537, size - 100, size - 1] {
            let mut via_pool = vec![0u8; 100];
            let n = pool.read_at(&mut via_pool, off).await.unwrap();

            let mut direct = PseudoRandomReader { size, pos: 0 };
            direct.seek(off).await.unwrap();
            let mut via_seek = vec![0u8; 100];
            let m = direct.read(&mut via_seek).await.unwrap();

            assert_eq!(n, m, "offset {off}");
            assert_eq!(via_pool[..n], via_seek[..m], "offset {off}");
        }
    }

    #[tokio::test]
    async fn read_past_eof_returns_zero() {
        let (pool, _) = pool(100);
        let mut buf = [0u8; 10];
        assert_eq!(pool.read_at(&mut buf, 100).await.unwrap(), 0);
        assert_eq!(pool.read_at(&mut buf, 5000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_read_at_eof_is_not_an_error() {
        let (pool, _) = pool(100);
        let mut buf = [0u8; 64];
        assert_eq!(pool.read_at(&mut buf, 90).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn closed_pool_rejects_reads() {
        let (pool, _) = pool(100);
        pool.close().await;
        let mut buf = [0u8; 10];
        assert_eq!(
            pool.read_at(&mut buf, 0).await.unwrap_err(),
            FsError::BadHandle
        );
    }
}
