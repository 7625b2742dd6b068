//! Retry proxy over a raw DFS client.
//!
//! Every RPC runs inside the shared retry policy. A retriable failure closes
//! the underlying connection first, so the next attempt reconnects instead of
//! reusing a poisoned socket. Non-retriable errors surface immediately.

use std::sync::Arc;

use async_trait::async_trait;

use crate::fs::attrs::{Attrs, FsInfo};
use crate::fs::dfs::{DfsClient, DfsReader, DfsWriter, RenameOptions};
use crate::fs::error::FsError;
use crate::fs::retry::RetryPolicy;

pub struct FaultTolerantDfsClient {
    inner: Arc<dyn DfsClient>,
    policy: Arc<RetryPolicy>,
}

impl FaultTolerantDfsClient {
    pub fn new(inner: Arc<dyn DfsClient>, policy: Arc<RetryPolicy>) -> Self {
        Self { inner, policy }
    }

    /// The wrapped raw client.
    pub fn raw(&self) -> Arc<dyn DfsClient> {
        self.inner.clone()
    }
}

/// Run `$call` under the retry policy, reconnecting between attempts.
macro_rules! with_retry {
    ($self:ident, $ctx:expr, $call:expr) => {{
        let mut op = $self.policy.start_operation();
        loop {
            match $call {
                Ok(value) => break Ok(value),
                Err(e) if !e.is_retriable() => break Err(e),
                Err(e) => {
                    if op.should_retry($ctx, &e).await {
                        // Drop the bad connection so the next attempt dials anew.
                        let _ = $self.inner.close().await;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

#[async_trait]
impl DfsClient for FaultTolerantDfsClient {
    async fn ensure_connected(&self) -> Result<(), FsError> {
        with_retry!(self, "Connect", self.inner.ensure_connected().await)
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn DfsReader>, FsError> {
        with_retry!(self, "OpenRead", self.inner.open_read(path).await)
    }

    async fn create_file(
        &self,
        path: &str,
        mode: u32,
        overwrite: bool,
    ) -> Result<Box<dyn DfsWriter>, FsError> {
        // Not retried here: the handle-flush loop owns write retry end to end.
        self.inner.create_file(path, mode, overwrite).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<Attrs>, FsError> {
        with_retry!(self, "ReadDir", self.inner.read_dir(path).await)
    }

    async fn stat(&self, path: &str) -> Result<Attrs, FsError> {
        with_retry!(self, "Stat", self.inner.stat(path).await)
    }

    async fn statfs(&self) -> Result<FsInfo, FsError> {
        with_retry!(self, "StatFs", self.inner.statfs().await)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        with_retry!(self, "Mkdir", self.inner.mkdir(path, mode).await)
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        with_retry!(self, "Remove", self.inner.remove(path).await)
    }

    async fn rename(&self, old: &str, new: &str, options: RenameOptions) -> Result<(), FsError> {
        with_retry!(self, "Rename", self.inner.rename(old, new, options).await)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        with_retry!(self, "Chmod", self.inner.chmod(path, mode).await)
    }

    async fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), FsError> {
        with_retry!(self, "Chown", self.inner.chown(path, user, group).await)
    }

    async fn close(&self) -> Result<(), FsError> {
        self.inner.close().await
    }
}
