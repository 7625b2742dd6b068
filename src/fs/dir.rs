//! Directory nodes.
//!
//! Children are populated lazily: a `readdir` speculatively seeds every
//! listed child so the lookup storm an `ls -l` produces is served from
//! memory. Structural operations serialize on `dir_lock`; the children map
//! has its own short-lived lock so helpers that only touch the map never
//! participate in lock ordering with other directories (rename needs this).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::fs::attrs::Attrs;
use crate::fs::dfs::RenameOptions;
use crate::fs::error::FsError;
use crate::fs::file::FileNode;
use crate::fs::handle::FileHandle;
use crate::fs::setattr::{apply_common, SetattrChanges};
use crate::fs::{join_path, Filesystem, Inode, ROOT_INO};

/// One directory entry as reported to the kernel.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: fuser::FileType,
}

pub struct DirNode {
    pub(crate) fs: Weak<Filesystem>,
    pub(crate) ino: u64,
    /// `None` only for the root.
    pub(crate) parent: Mutex<Option<Weak<DirNode>>>,
    pub(crate) attrs: Mutex<Attrs>,
    children: Mutex<HashMap<String, Inode>>,
    /// Serializes structural operations on this directory.
    dir_lock: AsyncMutex<()>,
}

impl DirNode {
    pub(crate) fn new_root(
        fs: Weak<Filesystem>,
        uid: u32,
        gid: u32,
        now: SystemTime,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            ino: ROOT_INO,
            parent: Mutex::new(None),
            attrs: Mutex::new(Attrs {
                ino: ROOT_INO,
                name: String::new(),
                mode: 0o755,
                is_dir: true,
                size: 0,
                uid,
                gid,
                dfs_user: String::new(),
                dfs_group: String::new(),
                mtime: now,
                ctime: now,
                // The root is authoritative; it is never stale-looked-up via
                // a parent.
                expires: None,
            }),
            children: Mutex::new(HashMap::new()),
            dir_lock: AsyncMutex::new(()),
        })
    }

    fn filesystem(&self) -> Result<Arc<Filesystem>, FsError> {
        self.fs.upgrade().ok_or(FsError::BadHandle)
    }

    /// Absolute path of this directory in the DFS namespace.
    pub fn absolute_path(&self) -> String {
        let parent = self.parent.lock().as_ref().and_then(Weak::upgrade);
        match parent {
            None => self
                .fs
                .upgrade()
                .map_or_else(|| "/".to_owned(), |fs| fs.config.src_dir.clone()),
            Some(parent) => join_path(&parent.absolute_path(), &self.attrs.lock().name),
        }
    }

    /// Absolute path of a child of this directory.
    pub fn path_for_child(&self, name: &str) -> String {
        join_path(&self.absolute_path(), name)
    }

    fn get_child(&self, operation: &str, name: &str) -> Option<Inode> {
        let children = self.children.lock();
        let node = children.get(name).cloned();
        trace!(
            operation,
            parent = %self.absolute_path(),
            child = name,
            hit = node.is_some(),
            children = children.len(),
            "children cache probe"
        );
        node
    }

    /// Insert a child for `attrs`, or refresh the attrs of the existing one.
    /// The node object is preserved across refreshes so open handles survive.
    pub(crate) fn upsert_child(&self, name: &str, mut attrs: Attrs) -> Result<Inode, FsError> {
        let fs = self.filesystem()?;
        let mut children = self.children.lock();

        if let Some(existing) = children.get(name) {
            attrs.ino = existing.ino();
            attrs.name = name.to_owned();
            match existing {
                Inode::Dir(d) => *d.attrs.lock() = attrs,
                Inode::File(f) => *f.attrs.lock() = attrs,
            }
            return Ok(existing.clone());
        }

        attrs.ino = fs.allocate_ino();
        attrs.name = name.to_owned();
        let self_arc = fs
            .node(self.ino)
            .and_then(|n| n.as_dir().cloned())
            .ok_or(FsError::BadHandle)?;

        let node = if attrs.is_dir {
            Inode::Dir(Arc::new(DirNode {
                fs: self.fs.clone(),
                ino: attrs.ino,
                parent: Mutex::new(Some(Arc::downgrade(&self_arc))),
                attrs: Mutex::new(attrs),
                children: Mutex::new(HashMap::new()),
                dir_lock: AsyncMutex::new(()),
            }))
        } else {
            Inode::File(FileNode::new(
                self.fs.clone(),
                attrs,
                Arc::downgrade(&self_arc),
            ))
        };
        fs.register_node(node.clone());
        children.insert(name.to_owned(), node.clone());
        Ok(node)
    }

    pub(crate) fn remove_child(&self, name: &str) {
        let mut children = self.children.lock();
        children.remove(name);
        trace!(
            parent = %self.absolute_path(),
            child = name,
            children = children.len(),
            "removed child from cache"
        );
    }

    /// Take over an inode moved here by rename.
    fn adopt_child(&self, name: &str, node: Inode) {
        let mut children = self.children.lock();
        children.insert(name.to_owned(), node);
    }

    /// Stat `name` on the DFS and (re)seed the child entry.
    pub(crate) async fn stat_child(&self, operation: &str, name: &str) -> Result<Inode, FsError> {
        let fs = self.filesystem()?;
        let path = self.path_for_child(name);

        match fs.get_connector().stat(&path).await {
            Err(e) => {
                info!(operation, %path, error = %e, "stat failed on backend");
                self.remove_child(name);
                Err(e)
            }
            Ok(mut attrs) => {
                attrs.touch(fs.clock.now());
                debug!(
                    operation,
                    %path,
                    size = attrs.size,
                    is_dir = attrs.is_dir,
                    "stat successful on backend"
                );
                self.upsert_child(name, attrs)
            }
        }
    }

    /// Directory attributes, refreshed from the parent when stale.
    pub async fn getattr(&self) -> Result<fuser::FileAttr, FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;

        let parent = self.parent.lock().as_ref().and_then(Weak::upgrade);
        if let Some(parent) = parent {
            let (name, expired) = {
                let attrs = self.attrs.lock();
                (attrs.name.clone(), attrs.expired(fs.clock.now()))
            };
            if expired {
                parent.stat_child("getattr-dir", &name).await?;
            } else {
                debug!(path = %self.absolute_path(), "getattr served from cache");
            }
        }
        Ok(self.attrs.lock().to_fuse())
    }

    #[instrument(skip(self), fields(parent = %self.absolute_path()))]
    pub async fn lookup(&self, name: &str) -> Result<Inode, FsError> {
        let _guard = self.dir_lock.lock().await;
        self.lookup_locked("lookup", name).await
    }

    /// Lookup without taking `dir_lock`; shared with rename.
    async fn lookup_locked(&self, operation: &str, name: &str) -> Result<Inode, FsError> {
        let fs = self.filesystem()?;
        if !fs.is_path_allowed(&self.path_for_child(name)) {
            return Err(FsError::NotFound);
        }

        if let Some(node) = self.get_child(operation, name) {
            return Ok(node);
        }
        self.stat_child(operation, name).await
    }

    /// List the directory, seeding every visible child so the follow-up
    /// lookups are cache hits.
    #[instrument(skip(self), fields(path = %self.absolute_path()))]
    pub async fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let path = self.absolute_path();

        info!(%path, "reading directory");
        let listing = match fs.get_connector().read_dir(&path).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(%path, error = %e, "failed to list DFS directory");
                return Err(e);
            }
        };

        let now = fs.clock.now();
        let mut entries = Vec::with_capacity(listing.len());
        for mut attrs in listing {
            if !fs.is_path_allowed(&self.path_for_child(&attrs.name)) {
                continue;
            }
            attrs.touch(now);
            let name = attrs.name.clone();
            let node = self.upsert_child(&name, attrs)?;
            entries.push(DirEntry {
                ino: node.ino(),
                kind: node.attrs().kind(),
                name,
            });
        }
        Ok(entries)
    }

    #[instrument(skip(self), fields(parent = %self.absolute_path()))]
    pub async fn mkdir(&self, name: &str, mode: u32, uid: u32, gid: u32) -> Result<Inode, FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let path = self.path_for_child(name);

        let (user, group) = self.resolve_identity(&fs, &path, uid, gid)?;

        if let Err(e) = fs.get_connector().mkdir(&path, mode).await {
            info!(%path, error = %e, "mkdir failed");
            return Err(e);
        }
        debug!(%path, "mkdir successful");

        if let Err(e) = fs.get_connector().chown(&path, &user, &group).await {
            warn!(%path, uid, gid, error = %e, "could not chown new directory, rolling back");
            // The operation failed as a whole; best effort removal.
            let _ = fs.get_connector().remove(&path).await;
            return Err(e);
        }

        let now = fs.clock.now();
        let mut attrs = Attrs {
            ino: 0,
            name: name.to_owned(),
            mode,
            is_dir: true,
            size: 0,
            uid,
            gid,
            dfs_user: user,
            dfs_group: group,
            mtime: now,
            ctime: now,
            expires: None,
        };
        attrs.touch(now);
        self.upsert_child(name, attrs)
    }

    /// Create a regular file and its first (writable) handle.
    #[instrument(skip(self), fields(parent = %self.absolute_path()))]
    pub async fn create(
        &self,
        name: &str,
        mode: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> Result<(Arc<FileNode>, Arc<FileHandle>), FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let path = self.path_for_child(name);

        info!(%path, mode = %format_args!("{mode:o}"), flags, "creating a new file");

        let (user, group) = self.resolve_identity(&fs, &path, uid, gid)?;

        let now = fs.clock.now();
        let mut attrs = Attrs {
            ino: 0,
            name: name.to_owned(),
            mode,
            is_dir: false,
            size: 0,
            uid,
            gid,
            dfs_user: user.clone(),
            dfs_group: group.clone(),
            mtime: now,
            ctime: now,
            expires: None,
        };
        attrs.touch(now);

        let node = self.upsert_child(name, attrs)?;
        let file = node
            .as_file()
            .cloned()
            .ok_or(FsError::AlreadyExists)?;

        let handle = match file.new_file_handle(false, flags).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(%path, error = %e, "file creation failed");
                self.remove_child(name);
                return Err(e);
            }
        };

        if let Err(e) = fs.get_connector().chown(&path, &user, &group).await {
            warn!(%path, uid, gid, error = %e, "could not chown new file, rolling back");
            let _ = fs.get_connector().remove(&path).await;
            self.remove_child(name);
            return Err(e);
        }

        if let Err(e) = self.stat_child("create", name).await {
            self.remove_child(name);
            return Err(e);
        }

        Ok((file, handle))
    }

    #[instrument(skip(self), fields(parent = %self.absolute_path()))]
    pub async fn remove(&self, name: &str) -> Result<(), FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let path = self.path_for_child(name);

        debug!(%path, "removing path");
        match fs.get_connector().remove(&path).await {
            Ok(()) => {
                self.remove_child(name);
                info!(%path, "removed path");
                Ok(())
            }
            Err(e) => {
                warn!(%path, error = %e, "failed to remove path");
                Err(e)
            }
        }
    }

    /// Move `old_name` from this directory to `new_name` under `new_parent`.
    #[instrument(skip(self, new_parent), fields(from = %self.path_for_child(old_name)))]
    pub async fn rename(
        &self,
        old_name: &str,
        new_parent: &Arc<DirNode>,
        new_name: &str,
        options: RenameOptions,
    ) -> Result<(), FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let old_path = self.path_for_child(old_name);
        let new_path = new_parent.path_for_child(new_name);

        debug!(from = %old_path, to = %new_path, "renaming");

        let source = match self.lookup_locked("rename", old_name).await {
            Ok(node) => node,
            Err(e) => {
                error!(from = %old_path, to = %new_path, "rename failed, source not found");
                return Err(e);
            }
        };

        let destination = new_parent.lookup_locked("rename", new_name).await.ok();

        if let Err(e) = fs
            .get_connector()
            .rename(&old_path, &new_path, options)
            .await
        {
            error!(from = %old_path, to = %new_path, error = %e, "rename failed at the backend");
            return Err(e);
        }

        // Disconnect the source and any replaced destination, then re-parent.
        self.remove_child(old_name);
        if destination.is_some() {
            new_parent.remove_child(new_name);
        }

        match &source {
            Inode::Dir(d) => {
                d.attrs.lock().name = new_name.to_owned();
                *d.parent.lock() = Some(Arc::downgrade(new_parent));
            }
            Inode::File(f) => {
                f.attrs.lock().name = new_name.to_owned();
                f.set_parent(Arc::downgrade(new_parent));
            }
        }
        new_parent.adopt_child(new_name, source);

        info!(from = %old_path, to = %new_path, "renamed");
        Ok(())
    }

    pub async fn setattr(&self, changes: SetattrChanges) -> Result<fuser::FileAttr, FsError> {
        let _guard = self.dir_lock.lock().await;
        let fs = self.filesystem()?;
        let path = self.absolute_path();

        if changes.size.is_some() {
            error!(%path, "cannot set the size of a directory");
            return Err(FsError::NotSupported);
        }

        apply_common(&fs, &self.attrs, &path, &changes).await?;
        Ok(self.attrs.lock().to_fuse())
    }

    /// Every directory mutation already went through the DFS.
    pub async fn fsync(&self) -> Result<(), FsError> {
        debug!(path = %self.absolute_path(), "fsync on directory is a no-op");
        Ok(())
    }

    /// The kernel dropped its references. Inodes are removed on delete and
    /// rename instead: a forget arriving after the same name was re-created
    /// would tear down the wrong node.
    pub fn forget(&self) {}

    fn resolve_identity(
        &self,
        fs: &Arc<Filesystem>,
        path: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(String, String), FsError> {
        let user = crate::fs::idcache::user_name_for(&fs.idcache, &fs.config.identity, uid)
            .inspect_err(|_| {
                error!(%path, uid, "unable to resolve user for request");
            })?;
        let group =
            crate::fs::idcache::group_name_for(&fs.idcache, &fs.config.identity, path, gid)
                .inspect_err(|_| {
                    error!(%path, gid, "unable to resolve group for request");
                })?;
        Ok((user, group))
    }
}
