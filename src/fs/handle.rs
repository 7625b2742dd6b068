//! Per-open file handles.
//!
//! A handle serializes its own operations, accounts bytes read and written,
//! and owns the upload path: `flush`/`fsync` copy the staging file back to
//! the DFS under the retry policy, reconnecting between attempts. The handle
//! id is random and purely informational.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::fs::error::FsError;
use crate::fs::file::{FileNode, COPY_CHUNK_SIZE};

#[derive(Default)]
struct HandleState {
    bytes_read: u64,
    bytes_written: u64,
}

pub struct FileHandle {
    /// Random id, for logging and kernel handle correlation.
    pub(crate) id: u64,
    file: Weak<FileNode>,
    flags: i32,
    state: AsyncMutex<HandleState>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle").field("id", &self.id).finish()
    }
}

impl FileHandle {
    pub(crate) fn new(file: &Arc<FileNode>, flags: i32) -> Arc<Self> {
        Arc::new(Self {
            id: rand::random(),
            file: Arc::downgrade(file),
            flags,
            state: AsyncMutex::new(HandleState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn file(&self) -> Result<Arc<FileNode>, FsError> {
        self.file.upgrade().ok_or(FsError::BadHandle)
    }

    fn is_writable(&self) -> bool {
        self.flags & libc::O_ACCMODE != libc::O_RDONLY
    }

    /// Read `size` bytes at `offset`. A short or empty result means end of
    /// file; EOF is never an error to the kernel once bytes were returned.
    #[instrument(skip(self), fields(handle = self.id))]
    pub async fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let mut state = self.state.lock().await;
        let file = self.file()?;

        let mut buf = vec![0u8; size as usize];
        let mut proxy = file.proxy.lock().await;
        let proxy = proxy.as_mut().ok_or(FsError::BadHandle)?;

        match proxy.read_at(&mut buf, offset).await {
            Ok(n) => {
                state.bytes_read += n as u64;
                trace!(bytes = n, offset, "read");
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Err(FsError::Eof) => {
                debug!(offset, "read at end of file");
                Ok(Bytes::new())
            }
            Err(e) => {
                error!(offset, error = %e, "read failed");
                Err(e)
            }
        }
    }

    /// Write `data` at `offset`, upgrading the file to a staged copy first.
    #[instrument(skip(self, data), fields(handle = self.id, bytes = data.len()))]
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let mut state = self.state.lock().await;
        let file = self.file()?;

        file.upgrade_for_writing().await?;

        let mut proxy = file.proxy.lock().await;
        let proxy = proxy.as_mut().ok_or(FsError::BadHandle)?;
        let n = proxy.write_at(data, offset).await.inspect_err(|e| {
            error!(offset, error = %e, "failed to write to staging file");
        })?;
        state.bytes_written += n as u64;
        trace!(bytes = n, offset, "wrote to staging file");
        Ok(n as u32)
    }

    /// Truncate the staged copy. The absolute size delta counts as written
    /// bytes so a later flush knows there is work to do.
    #[instrument(skip(self), fields(handle = self.id))]
    pub async fn truncate(&self, size: u64) -> Result<(), FsError> {
        let mut state = self.state.lock().await;
        let file = self.file()?;

        file.upgrade_for_writing().await?;

        let mut proxy = file.proxy.lock().await;
        let proxy = proxy.as_mut().ok_or(FsError::BadHandle)?;
        let delta = proxy.truncate(size).await.inspect_err(|e| {
            error!(size, error = %e, "failed to truncate staging file");
        })?;
        state.bytes_written += delta;
        info!(size, delta, "truncated staging file");
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), FsError> {
        let mut state = self.state.lock().await;
        if !self.is_writable() {
            return Ok(());
        }
        info!(handle = self.id, "flush");
        self.copy_to_dfs(&mut state).await
    }

    pub async fn fsync(&self) -> Result<(), FsError> {
        let mut state = self.state.lock().await;
        if !self.is_writable() {
            return Ok(());
        }
        info!(handle = self.id, "fsync");
        self.copy_to_dfs(&mut state).await
    }

    /// Upload the staging file to the DFS under the retry policy.
    ///
    /// Without written bytes the staging copy matches the remote file and
    /// this is a no-op, which also makes back-to-back flushes idempotent.
    async fn copy_to_dfs(&self, state: &mut HandleState) -> Result<(), FsError> {
        if state.bytes_written == 0 {
            return Ok(());
        }

        let file = self.file()?;
        let fs = file.fs.upgrade().ok_or(FsError::BadHandle)?;
        debug!(
            handle = self.id,
            bytes = state.bytes_written,
            "uploading staged content to DFS"
        );

        let result = {
            let mut op = fs.policy.start_operation();
            loop {
                match self.flush_attempt(&file, &fs).await {
                    Ok(written) => {
                        file.attrs.lock().size = written;
                        state.bytes_written = 0;
                        break Ok(());
                    }
                    Err(e) if !e.is_retriable() => break Err(e),
                    Err(e) => {
                        if op.should_retry("Flush", &e).await {
                            // Force a fresh connection for the next attempt.
                            let _ = fs.get_connector().close().await;
                            warn!(handle = self.id, error = %e, "flush attempt failed, retrying");
                        } else {
                            break Err(e);
                        }
                    }
                }
            }
        };
        file.invalidate_attr_cache();
        result
    }

    /// One end-to-end upload attempt: recreate the DFS file and stream the
    /// staging copy into it in fixed-size chunks.
    async fn flush_attempt(
        &self,
        file: &Arc<FileNode>,
        fs: &Arc<crate::fs::Filesystem>,
    ) -> Result<u64, FsError> {
        let path = file.absolute_path();
        let connector = fs.get_connector();

        // A mode-0444 file cannot be overwritten in place; drop it first.
        match connector.remove(&path).await {
            Ok(()) | Err(FsError::NotFound) => {}
            Err(e) => {
                error!(%path, error = %e, "failed to remove file before upload");
                return Err(e);
            }
        }

        let mode = file.attrs.lock().mode;
        let mut writer = connector
            .create_file(&path, mode, true)
            .await
            .inspect_err(|e| error!(%path, error = %e, "error creating file in DFS"))?;

        let mut proxy = file.proxy.lock().await;
        let proxy = proxy.as_mut().ok_or(FsError::BadHandle)?;
        proxy.seek_to_start().await.inspect_err(|e| {
            error!(%path, error = %e, "unable to seek to the beginning of the staging file");
        })?;

        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let nr = match proxy.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!(%path, error = %e, "failed to read from staging file");
                    let _ = writer.close().await;
                    return Err(e);
                }
            };
            let nw = match writer.write(&chunk[..nr]).await {
                Ok(n) => n,
                Err(e) => {
                    error!(%path, error = %e, "failed to write to DFS");
                    let _ = writer.close().await;
                    return Err(e);
                }
            };
            if nw != nr {
                error!(%path, read = nr, wrote = nw, "short write to DFS");
                let _ = writer.close().await;
                return Err(FsError::Io("short write during upload".into()));
            }
            written += nw as u64;
            trace!(%path, bytes = nw, "chunk written to DFS");
        }

        writer
            .close()
            .await
            .inspect_err(|e| error!(%path, error = %e, "failed to close file in DFS"))?;
        info!(%path, bytes = written, "uploaded to DFS");
        Ok(written)
    }

    /// Close this handle: invalidate the attr cache and leave the active
    /// set; the last handle out drops the shared proxy.
    pub async fn release(self: &Arc<Self>) -> Result<(), FsError> {
        let file = self.file()?;
        file.invalidate_attr_cache();
        file.remove_handle(self).await;

        let state = self.state.lock().await;
        info!(
            handle = self.id,
            path = %file.absolute_path(),
            flags = self.flags,
            bytes_read = state.bytes_read,
            bytes_written = state.bytes_written,
            "closed file handle"
        );
        Ok(())
    }

    /// Bytes written through this handle since the last successful upload.
    pub async fn pending_bytes(&self) -> u64 {
        self.state.lock().await.bytes_written
    }
}
