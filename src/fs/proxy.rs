//! Unified backing for an open regular file.
//!
//! A file that has only been read streams straight from the DFS
//! ([`FileProxy::RemoteRo`]); the first write upgrades the whole file to a
//! local staging copy ([`FileProxy::LocalRw`]). All handles of one file share
//! one proxy, and the only legal transitions are `None → RemoteRo`,
//! `None → LocalRw` and `RemoteRo → LocalRw`.

use std::os::unix::fs::FileExt as _;
use std::time::SystemTime;

use tracing::{debug, error};

use crate::fs::dfs::DfsReader as _;
use crate::fs::error::FsError;
use crate::fs::reader::FtReader;
use crate::fs::reader_pool::ReaderPool;

/// Read-write staging copy on local disk. The backing file is anonymous
/// (unlinked at creation) and lives only as long as this proxy.
pub struct LocalRwProxy {
    staging: std::fs::File,
    /// Cursor for the sequential `read` path used by the DFS upload loop.
    pos: u64,
}

impl LocalRwProxy {
    pub fn new(staging: std::fs::File) -> Self {
        Self { staging, pos: 0 }
    }

    /// Size and mtime of the staging file; while a file is open for writing
    /// this is the authoritative source of its attributes.
    pub fn stat(&self) -> Result<(u64, SystemTime), FsError> {
        let meta = self.staging.metadata()?;
        let mtime = meta.modified()?;
        Ok((meta.len(), mtime))
    }
}

/// Read-only streaming proxy over the remote file.
pub struct RemoteRoProxy {
    reader: FtReader,
    pool: ReaderPool,
}

impl RemoteRoProxy {
    pub fn new(reader: FtReader, pool: ReaderPool) -> Self {
        Self { reader, pool }
    }
}

pub enum FileProxy {
    LocalRw(LocalRwProxy),
    RemoteRo(RemoteRoProxy),
}

impl FileProxy {
    pub fn is_local_rw(&self) -> bool {
        matches!(self, Self::LocalRw(_))
    }

    /// Truncate to `size`, returning the absolute size delta so the caller
    /// can account the change as written bytes.
    pub async fn truncate(&mut self, size: u64) -> Result<u64, FsError> {
        match self {
            Self::LocalRw(local) => {
                let (before, _) = local.stat()?;
                local.staging.set_len(size)?;
                let (after, _) = local.stat()?;
                Ok(before.abs_diff(after))
            }
            Self::RemoteRo(_) => {
                error!("truncate on a read-only remote proxy");
                Err(FsError::ReadOnly)
            }
        }
    }

    pub async fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, FsError> {
        match self {
            Self::LocalRw(local) => {
                local.staging.write_all_at(data, offset)?;
                Ok(data.len())
            }
            Self::RemoteRo(_) => {
                error!("write on a read-only remote proxy");
                Err(FsError::ReadOnly)
            }
        }
    }

    /// Read at `offset` until `buf` is full or EOF. A short count means end
    /// of file; it is not an error.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        match self {
            Self::LocalRw(local) => {
                let mut filled = 0;
                while filled < buf.len() {
                    let n = local.staging.read_at(&mut buf[filled..], offset + filled as u64)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(filled)
            }
            Self::RemoteRo(remote) => remote.pool.read_at(buf, offset).await,
        }
    }

    /// Sequential read at the proxy cursor.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        match self {
            Self::LocalRw(local) => {
                let n = local.staging.read_at(buf, local.pos)?;
                local.pos += n as u64;
                Ok(n)
            }
            Self::RemoteRo(remote) => remote.reader.read(buf).await,
        }
    }

    pub async fn seek_to_start(&mut self) -> Result<(), FsError> {
        match self {
            Self::LocalRw(local) => {
                local.pos = 0;
                Ok(())
            }
            Self::RemoteRo(remote) => remote.reader.seek(0).await,
        }
    }

    pub async fn sync(&mut self) -> Result<(), FsError> {
        match self {
            Self::LocalRw(local) => {
                local.staging.sync_all()?;
                Ok(())
            }
            Self::RemoteRo(_) => {
                error!("sync on a read-only remote proxy");
                Err(FsError::ReadOnly)
            }
        }
    }

    /// Staging size and mtime when this proxy is a local staging copy.
    pub fn staging_stat(&self) -> Option<Result<(u64, SystemTime), FsError>> {
        match self {
            Self::LocalRw(local) => Some(local.stat()),
            Self::RemoteRo(_) => None,
        }
    }

    pub async fn close(&mut self) -> Result<(), FsError> {
        match self {
            Self::LocalRw(_) => {
                // Dropping the proxy closes the anonymous staging file.
                debug!("closing staging proxy");
                Ok(())
            }
            Self::RemoteRo(remote) => {
                remote.pool.close().await;
                remote.reader.close().await
            }
        }
    }
}
