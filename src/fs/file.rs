//! Regular-file nodes.
//!
//! A file node owns the proxy shared by all of its open handles and the list
//! of those handles. Lock order is `file_lock` → `handles` → a handle's own
//! lock → `proxy`; proxy I/O is serialized by the proxy mutex itself, and the
//! read→write upgrade takes `handles` followed by `proxy` so it excludes both
//! new opens and in-flight I/O while it swaps the backing.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::fs::attrs::Attrs;
use crate::fs::dfs::DfsClient;
use crate::fs::dir::DirNode;
use crate::fs::error::FsError;
use crate::fs::handle::FileHandle;
use crate::fs::proxy::{FileProxy, LocalRwProxy, RemoteRoProxy};
use crate::fs::reader::FtReader;
use crate::fs::reader_pool::{ReaderFactory, ReaderPool};
use crate::fs::retry::RetryPolicy;
use crate::fs::setattr::{apply_common, SetattrChanges};
use crate::fs::{join_path, Filesystem};

/// Refuse to stage new writes when the staging volume has less than this
/// many bytes left.
const MIN_FREE_STAGING_BYTES: u64 = 64 * 1024 * 1024;

/// Upload/download chunk size.
pub(crate) const COPY_CHUNK_SIZE: usize = 64 * 1024;

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode").field("ino", &self.ino).finish()
    }
}

pub struct FileNode {
    pub(crate) fs: Weak<Filesystem>,
    pub(crate) ino: u64,
    parent: parking_lot::Mutex<Weak<DirNode>>,
    pub(crate) attrs: parking_lot::Mutex<Attrs>,
    /// Broad inode state: open, getattr, setattr, fsync fan-out, release.
    file_lock: AsyncMutex<()>,
    /// The set of open handles.
    handles: AsyncMutex<Vec<Arc<FileHandle>>>,
    /// Shared backing for every open handle of this file.
    pub(crate) proxy: AsyncMutex<Option<FileProxy>>,
}

/// Opens pooled fault-tolerant readers for one remote path.
struct FtReaderFactory {
    path: String,
    client: Arc<dyn DfsClient>,
    policy: Arc<RetryPolicy>,
}

#[async_trait::async_trait]
impl ReaderFactory for FtReaderFactory {
    async fn open_reader(&self) -> Result<Box<dyn crate::fs::dfs::DfsReader>, FsError> {
        Ok(Box::new(FtReader::new(
            self.path.clone(),
            self.client.clone(),
            self.policy.clone(),
        )))
    }
}

impl FileNode {
    pub(crate) fn new(
        fs: Weak<Filesystem>,
        attrs: Attrs,
        parent: Weak<DirNode>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            ino: attrs.ino,
            parent: parking_lot::Mutex::new(parent),
            attrs: parking_lot::Mutex::new(attrs),
            file_lock: AsyncMutex::new(()),
            handles: AsyncMutex::new(Vec::new()),
            proxy: AsyncMutex::new(None),
        })
    }

    fn filesystem(&self) -> Result<Arc<Filesystem>, FsError> {
        self.fs.upgrade().ok_or(FsError::BadHandle)
    }

    fn parent(&self) -> Result<Arc<DirNode>, FsError> {
        self.parent.lock().upgrade().ok_or(FsError::BadHandle)
    }

    pub(crate) fn set_parent(&self, parent: Weak<DirNode>) {
        *self.parent.lock() = parent;
    }

    pub fn absolute_path(&self) -> String {
        let name = self.attrs.lock().name.clone();
        match self.parent.lock().upgrade() {
            Some(parent) => join_path(&parent.absolute_path(), &name),
            None => name,
        }
    }

    /// File attributes. While the file is staged locally for writing, the
    /// staging file is the authoritative source of size and mtime.
    pub async fn getattr(&self) -> Result<fuser::FileAttr, FsError> {
        let _guard = self.file_lock.lock().await;
        let fs = self.filesystem()?;

        {
            let proxy = self.proxy.lock().await;
            if let Some(stat) = proxy.as_ref().and_then(FileProxy::staging_stat) {
                let (size, mtime) = stat.inspect_err(|e| {
                    warn!(path = %self.absolute_path(), error = %e, "stat failed on staging file");
                })?;
                let mut attrs = self.attrs.lock();
                attrs.size = size;
                attrs.mtime = mtime;
                return Ok(attrs.to_fuse());
            }
        }

        let (name, expired) = {
            let attrs = self.attrs.lock();
            (attrs.name.clone(), attrs.expired(fs.clock.now()))
        };
        if expired {
            self.parent()?.stat_child("getattr-file", &name).await?;
        } else {
            debug!(path = %self.absolute_path(), "getattr served from cache");
        }
        Ok(self.attrs.lock().to_fuse())
    }

    /// Open one more handle on this file.
    pub async fn open(self: &Arc<Self>, flags: i32) -> Result<Arc<FileHandle>, FsError> {
        let _guard = self.file_lock.lock().await;
        debug!(
            path = %self.absolute_path(),
            flags,
            size = self.attrs.lock().size,
            "opening file"
        );
        self.new_file_handle(true, flags).await
    }

    /// Create a handle, installing the proxy when this is the first open.
    ///
    /// Create mode (`exists_in_dfs == false`) writes an empty file to the DFS
    /// and stages a fresh local copy. Open mode shares an existing proxy, or
    /// starts a remote read-only stream; the first write upgrades it.
    pub(crate) async fn new_file_handle(
        self: &Arc<Self>,
        exists_in_dfs: bool,
        flags: i32,
    ) -> Result<Arc<FileHandle>, FsError> {
        let fs = self.filesystem()?;
        let path = self.absolute_path();
        let mut handles = self.handles.lock().await;
        let mut proxy = self.proxy.lock().await;

        let handle = FileHandle::new(self, flags);

        if !exists_in_dfs {
            if proxy.is_some() {
                error!(%path, "file proxy already present while creating");
                return Err(FsError::Io("unexpected file state during creation".into()));
            }
            self.check_staging_space(&fs)?;

            let mode = self.attrs.lock().mode;
            let mut writer = fs
                .get_connector()
                .create_file(&path, mode, false)
                .await
                .inspect_err(|e| error!(%path, error = %e, "failed to create file in DFS"))?;
            writer.close().await?;
            info!(%path, "created an empty file in DFS");

            let staging = self.create_staging_file(&fs)?;
            *proxy = Some(FileProxy::LocalRw(LocalRwProxy::new(staging)));
            info!(%path, handle = handle.id, "opened file, RW handle");
        } else if proxy.is_some() {
            info!(%path, handle = handle.id, "opened file, sharing existing proxy");
        } else {
            // Always open read-only first; the first write upgrades the
            // whole file to a staged copy.
            let connector = fs.get_connector();
            let stream = connector
                .open_read(&path)
                .await
                .inspect_err(|e| warn!(%path, error = %e, "opening file failed"))?;
            let reader =
                FtReader::with_stream(stream, path.clone(), connector.clone(), fs.policy.clone());
            let pool = ReaderPool::new(Box::new(FtReaderFactory {
                path: path.clone(),
                client: connector,
                policy: fs.policy.clone(),
            }));
            *proxy = Some(FileProxy::RemoteRo(RemoteRoProxy::new(reader, pool)));
            info!(%path, handle = handle.id, "opened file, RO handle");
        }

        handles.push(handle.clone());
        Ok(handle)
    }

    /// Switch the shared proxy from remote streaming to a local staging copy.
    ///
    /// Holding `handles` excludes new opens and concurrent upgrades; taking
    /// the proxy lock afterwards waits out any in-flight I/O, so every handle
    /// observes the swap atomically.
    pub(crate) async fn upgrade_for_writing(&self) -> Result<(), FsError> {
        let handles = self.handles.lock().await;
        let mut proxy = self.proxy.lock().await;

        match proxy.as_ref() {
            Some(FileProxy::LocalRw(_)) => return Ok(()),
            Some(FileProxy::RemoteRo(_)) => {}
            None => {
                error!(path = %self.absolute_path(), "no proxy to upgrade");
                return Err(FsError::BadHandle);
            }
        }

        let fs = self.filesystem()?;
        let path = self.absolute_path();
        info!(
            path,
            active_handles = handles.len(),
            "upgrading file handle for writing"
        );

        if let Some(mut old) = proxy.take() {
            let _ = old.close().await;
        }

        self.check_staging_space(&fs)?;

        // The file must still exist remotely before we stage it.
        let connector = fs.get_connector();
        connector.stat(&path).await.map_err(|e| {
            error!(%path, error = %e, "failed to stat file in DFS");
            FsError::NotFound
        })?;

        let staging = self.create_staging_file(&fs)?;
        let copied = self
            .download_to_staging(&fs, &path, &staging)
            .await
            .inspect_err(|e| {
                error!(%path, error = %e, "failed to stage DFS file contents");
            })?;

        *proxy = Some(FileProxy::LocalRw(LocalRwProxy::new(staging)));
        info!(%path, bytes = copied, "open handle upgraded to RW");
        Ok(())
    }

    async fn download_to_staging(
        &self,
        fs: &Arc<Filesystem>,
        path: &str,
        staging: &std::fs::File,
    ) -> Result<u64, FsError> {
        use std::os::unix::fs::FileExt as _;

        let mut reader = fs.get_connector().open_read(path).await.inspect_err(|e| {
            error!(%path, error = %e, "failed to open file in DFS");
        })?;

        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            staging.write_all_at(&chunk[..n], offset)?;
            offset += n as u64;
        }
        let _ = reader.close().await;
        debug!(%path, bytes = offset, "downloaded a copy to the staging dir");
        Ok(offset)
    }

    fn create_staging_file(&self, fs: &Arc<Filesystem>) -> Result<std::fs::File, FsError> {
        // The temp file is anonymous from birth; it lives by fd only.
        let staging = tempfile::tempfile_in(&fs.config.stage_dir).inspect_err(|e| {
            error!(
                stage_dir = %fs.config.stage_dir.display(),
                error = %e,
                "failed to create staging file"
            );
        })?;
        info!(path = %self.absolute_path(), "created staging file");
        Ok(staging)
    }

    fn check_staging_space(&self, fs: &Arc<Filesystem>) -> Result<(), FsError> {
        let stat = nix::sys::statvfs::statvfs(&fs.config.stage_dir)
            .map_err(|e| FsError::Io(format!("statvfs on staging dir: {e}")))?;
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        if available < MIN_FREE_STAGING_BYTES {
            warn!(available, "staging volume is out of space");
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Dispatch fsync to every open handle.
    #[instrument(skip(self), fields(path = %self.absolute_path()))]
    pub async fn fsync(&self) -> Result<(), FsError> {
        let _guard = self.file_lock.lock().await;
        let handles = self.handles.lock().await.clone();
        info!(handles = handles.len(), "dispatching fsync to all open handles");

        let mut result = Ok(());
        for handle in handles {
            if let Err(e) = handle.fsync().await {
                result = Err(e);
            }
        }
        result
    }

    pub async fn setattr(&self, changes: SetattrChanges) -> Result<fuser::FileAttr, FsError> {
        let _guard = self.file_lock.lock().await;
        let fs = self.filesystem()?;
        debug!(path = %self.absolute_path(), "setattr on file");

        if let Some(size) = changes.size {
            // ftruncate semantics: every open descriptor observes the change.
            let handles = self.handles.lock().await.clone();
            info!(
                handles = handles.len(),
                size, "dispatching truncate to all open handles"
            );
            let mut result = Ok(());
            for handle in &handles {
                if let Err(e) = handle.truncate(size).await {
                    result = Err(e);
                }
            }
            self.attrs.lock().size = size;
            result?;
            return Ok(self.attrs.lock().to_fuse());
        }

        let path = self.absolute_path();
        apply_common(&fs, &self.attrs, &path, &changes).await?;
        Ok(self.attrs.lock().to_fuse())
    }

    /// Drop `handle` from the active set; the last one out tears down the
    /// shared proxy.
    pub(crate) async fn remove_handle(&self, handle: &Arc<FileHandle>) {
        let _guard = self.file_lock.lock().await;
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !Arc::ptr_eq(h, handle));

        if handles.is_empty() {
            let mut proxy = self.proxy.lock().await;
            if let Some(mut p) = proxy.take() {
                if let Err(e) = p.close().await {
                    error!(path = %self.absolute_path(), error = %e, "failed to close staging proxy");
                }
                info!(path = %self.absolute_path(), "file proxy closed");
            }
        } else {
            trace!(
                path = %self.absolute_path(),
                remaining = handles.len(),
                "proxy kept open for remaining handles"
            );
        }
    }

    /// Number of currently open handles.
    pub async fn active_handles(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub(crate) async fn find_handle(&self, id: u64) -> Option<Arc<FileHandle>> {
        self.handles
            .lock()
            .await
            .iter()
            .find(|h| h.id == id)
            .cloned()
    }

    /// Next stat or listing refreshes from the DFS.
    pub(crate) fn invalidate_attr_cache(&self) {
        let fs = self.fs.upgrade();
        if let Some(fs) = fs {
            debug!(path = %self.absolute_path(), "invalidating metadata cache");
            self.attrs.lock().invalidate(fs.clock.as_ref());
        }
    }

    /// See the comment on [`DirNode::forget`].
    pub fn forget(&self) {}

    /// Whether a proxy is currently installed (diagnostics and tests).
    pub async fn has_proxy(&self) -> bool {
        self.proxy.lock().await.is_some()
    }

    /// Whether the current proxy is the local staging variant.
    pub async fn is_staged(&self) -> bool {
        matches!(
            self.proxy.lock().await.as_ref(),
            Some(FileProxy::LocalRw(_))
        )
    }
}
