//! The seam between the filesystem core and the DFS wire client.
//!
//! Everything above this trait speaks [`Attrs`] and [`FsError`]; everything
//! below it speaks the wire protocol. The production implementation lives in
//! [`crate::fs::hopsfs`]; tests substitute an in-memory mock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::fs::attrs::{Attrs, FsInfo};
use crate::fs::error::FsError;

/// Options understood by the DFS rename RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameOptions {
    /// Replace the destination when it exists.
    #[default]
    None,
    /// Fail with `AlreadyExists` when the destination exists.
    NoReplace,
}

/// A stateful read cursor over one remote file.
#[async_trait]
pub trait DfsReader: Send {
    /// Read into `buf`; returns 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;

    async fn seek(&mut self, pos: u64) -> Result<(), FsError>;

    async fn position(&mut self) -> Result<u64, FsError>;

    async fn close(&mut self) -> Result<(), FsError>;
}

/// An append-only writer for a file being created.
#[async_trait]
pub trait DfsWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;

    /// Finish the upload. Must be called; dropping without closing aborts.
    async fn close(&mut self) -> Result<(), FsError>;
}

/// One connection to the DFS.
///
/// Implementations serialize their own RPCs; parallelism comes from pooling
/// several connectors (see [`DfsClientPool`]).
#[async_trait]
pub trait DfsClient: Send + Sync {
    async fn ensure_connected(&self) -> Result<(), FsError>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn DfsReader>, FsError>;

    async fn create_file(
        &self,
        path: &str,
        mode: u32,
        overwrite: bool,
    ) -> Result<Box<dyn DfsWriter>, FsError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<Attrs>, FsError>;

    async fn stat(&self, path: &str) -> Result<Attrs, FsError>;

    async fn statfs(&self) -> Result<FsInfo, FsError>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError>;

    async fn remove(&self, path: &str) -> Result<(), FsError>;

    async fn rename(&self, old: &str, new: &str, options: RenameOptions) -> Result<(), FsError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError>;

    async fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), FsError>;

    /// Tear down the current connection; the next call reconnects.
    async fn close(&self) -> Result<(), FsError>;
}

/// Fixed-size round-robin pool of connectors.
pub struct DfsClientPool {
    connectors: Vec<Arc<dyn DfsClient>>,
    next: AtomicUsize,
}

impl DfsClientPool {
    pub fn new(connectors: Vec<Arc<dyn DfsClient>>) -> Self {
        assert!(!connectors.is_empty(), "pool requires at least one connector");
        Self {
            connectors,
            next: AtomicUsize::new(0),
        }
    }

    /// Hand out the next connector, wrapping around.
    pub fn get_connector(&self) -> Arc<dyn DfsClient> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.connectors.len();
        self.connectors[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Close every connector (used during unmount).
    pub async fn close_all(&self) {
        for connector in &self.connectors {
            let _ = connector.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TaggedClient(usize);

    #[async_trait]
    impl DfsClient for TaggedClient {
        async fn ensure_connected(&self) -> Result<(), FsError> {
            Ok(())
        }
        async fn open_read(&self, _path: &str) -> Result<Box<dyn DfsReader>, FsError> {
            Err(FsError::NotSupported)
        }
        async fn create_file(
            &self,
            _path: &str,
            _mode: u32,
            _overwrite: bool,
        ) -> Result<Box<dyn DfsWriter>, FsError> {
            Err(FsError::NotSupported)
        }
        async fn read_dir(&self, _path: &str) -> Result<Vec<Attrs>, FsError> {
            Ok(Vec::new())
        }
        async fn stat(&self, _path: &str) -> Result<Attrs, FsError> {
            Err(FsError::NotFound)
        }
        async fn statfs(&self) -> Result<FsInfo, FsError> {
            // Tag smuggled through `capacity` to observe rotation.
            Ok(FsInfo {
                capacity: self.0 as u64,
                used: 0,
                remaining: 0,
            })
        }
        async fn mkdir(&self, _path: &str, _mode: u32) -> Result<(), FsError> {
            Ok(())
        }
        async fn remove(&self, _path: &str) -> Result<(), FsError> {
            Ok(())
        }
        async fn rename(
            &self,
            _old: &str,
            _new: &str,
            _options: RenameOptions,
        ) -> Result<(), FsError> {
            Ok(())
        }
        async fn chmod(&self, _path: &str, _mode: u32) -> Result<(), FsError> {
            Ok(())
        }
        async fn chown(&self, _path: &str, _user: &str, _group: &str) -> Result<(), FsError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), FsError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_rotates_round_robin() {
        let pool = DfsClientPool::new(vec![
            Arc::new(TaggedClient(0)),
            Arc::new(TaggedClient(1)),
            Arc::new(TaggedClient(2)),
        ]);

        let mut seen = Vec::new();
        for _ in 0..6 {
            let info = pool.get_connector().statfs().await.unwrap();
            seen.push(info.capacity);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }
}
