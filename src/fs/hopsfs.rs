//! Production [`DfsClient`] backed by the WebHDFS REST endpoint of a
//! HopsFS/HDFS name node.
//!
//! This is a thin translation layer: wire models become [`Attrs`] (with
//! owner/group names resolved to local ids through the identity cache) and
//! wire errors become the [`FsError`] taxonomy. Retry lives a layer above,
//! in the fault-tolerant wrapper.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::warn;

use crate::fs::attrs::{Attrs, FsInfo};
use crate::fs::clock::Clock;
use crate::fs::dfs::{DfsClient, DfsReader, DfsWriter, RenameOptions};
use crate::fs::error::FsError;
use crate::fs::idcache::{IdentityCache, IdentityConfig};

pub struct HopsFsClient {
    client: webhdfs::Client,
    clock: Arc<dyn Clock>,
    idcache: Arc<IdentityCache>,
    identity: IdentityConfig,
}

impl HopsFsClient {
    pub fn new(
        client: webhdfs::Client,
        clock: Arc<dyn Clock>,
        idcache: Arc<IdentityCache>,
        identity: IdentityConfig,
    ) -> Self {
        Self {
            client,
            clock,
            idcache,
            identity,
        }
    }

    fn attrs_from_status(&self, name: &str, status: &webhdfs::FileStatus) -> Attrs {
        let uid = self.idcache.lookup_uid(&status.owner);
        let gid = self.idcache.lookup_gid(&status.group);

        // When the username is forced these misses are routine; stay quiet.
        if self.identity.force_username.is_none() {
            if status.owner != "root" && uid == 0 {
                warn!(owner = %status.owner, "no local uid for DFS owner, using 0");
            }
            if status.group != "root" && gid == 0 {
                warn!(group = %status.group, "no local gid for DFS group, using 0");
            }
        }

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_millis(status.modification_time);
        Attrs {
            // Kernel inos are assigned by the inode table, not the DFS.
            ino: 0,
            name: name.to_owned(),
            mode: status.mode(),
            is_dir: status.is_dir(),
            size: status.length,
            uid,
            gid,
            dfs_user: status.owner.clone(),
            dfs_group: status.group.clone(),
            mtime,
            ctime: mtime,
            expires: Some(self.clock.now() + crate::fs::attrs::STAT_TTL),
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl DfsClient for HopsFsClient {
    async fn ensure_connected(&self) -> Result<(), FsError> {
        // A stat on the root doubles as an is-the-name-node-active probe.
        self.client.file_status("/").await.map_err(FsError::from)?;
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn DfsReader>, FsError> {
        Ok(Box::new(WebHdfsReadStream {
            inner: self.client.open(path, 0),
        }))
    }

    async fn create_file(
        &self,
        path: &str,
        mode: u32,
        overwrite: bool,
    ) -> Result<Box<dyn DfsWriter>, FsError> {
        let writer = self.client.create(path, mode & 0o777, overwrite).await?;
        Ok(Box::new(WebHdfsWriteStream { inner: writer }))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<Attrs>, FsError> {
        let listing = self.client.list_status(path).await?;
        Ok(listing
            .iter()
            .map(|status| self.attrs_from_status(&status.path_suffix, status))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Attrs, FsError> {
        let status = self.client.file_status(path).await?;
        let name = if status.path_suffix.is_empty() {
            basename(path)
        } else {
            &status.path_suffix
        };
        Ok(self.attrs_from_status(name, &status))
    }

    async fn statfs(&self) -> Result<FsInfo, FsError> {
        // WebHDFS has no cluster-capacity RPC; the content summary of the
        // namespace root is the closest available signal. Without a space
        // quota the volume reports as full.
        let summary = self.client.content_summary("/").await?;
        let used = summary.space_consumed;
        let capacity = if summary.space_quota > 0 {
            summary.space_quota as u64
        } else {
            used
        };
        Ok(FsInfo {
            capacity,
            used,
            remaining: capacity.saturating_sub(used),
        })
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.client.mkdirs(path, mode & 0o777).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        self.client.delete(path).await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str, options: RenameOptions) -> Result<(), FsError> {
        // The wire RENAME never replaces; emulate the replace flavour by
        // clearing the destination first.
        if self.client.rename(old, new).await? {
            return Ok(());
        }
        match options {
            RenameOptions::NoReplace => Err(FsError::AlreadyExists),
            RenameOptions::None => {
                match self.client.delete(new).await {
                    Ok(()) => {}
                    Err(e) => {
                        let translated = FsError::from(e);
                        if translated != FsError::NotFound {
                            return Err(translated);
                        }
                    }
                }
                if self.client.rename(old, new).await? {
                    Ok(())
                } else {
                    Err(FsError::Io(format!("rename {old} -> {new} refused")))
                }
            }
        }
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.client.set_permission(path, mode & 0o777).await?;
        Ok(())
    }

    async fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), FsError> {
        self.client.set_owner(path, user, group).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), FsError> {
        self.client.reset_connection();
        Ok(())
    }
}

struct WebHdfsReadStream {
    inner: webhdfs::FileReader,
}

#[async_trait]
impl DfsReader for WebHdfsReadStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.inner.read(buf).await.map_err(FsError::from)
    }

    async fn seek(&mut self, pos: u64) -> Result<(), FsError> {
        self.inner.seek(pos).await.map_err(FsError::from)
    }

    async fn position(&mut self) -> Result<u64, FsError> {
        Ok(self.inner.position())
    }

    async fn close(&mut self) -> Result<(), FsError> {
        self.inner.close();
        Ok(())
    }
}

struct WebHdfsWriteStream {
    inner: webhdfs::FileWriter,
}

#[async_trait]
impl DfsWriter for WebHdfsWriteStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        self.inner.write(buf).await.map_err(FsError::from)
    }

    async fn close(&mut self) -> Result<(), FsError> {
        self.inner.close().await.map_err(FsError::from)
    }
}
