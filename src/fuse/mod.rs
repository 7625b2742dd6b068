//! Bridge between `fuser`'s callback interface and the async filesystem
//! core.
//!
//! Each kernel request is spawned onto the tokio runtime so VFS calls run
//! concurrently; the callback thread never blocks on the DFS. Replies travel
//! with the spawned task.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, warn, Instrument as _};

use crate::fs::dir::DirNode;
use crate::fs::error::FsError;
use crate::fs::file::FileNode;
use crate::fs::handle::FileHandle;
use crate::fs::setattr::SetattrChanges;
use crate::fs::{Filesystem, Inode};

/// How long the kernel may cache entries and attributes we hand out. Kept
/// short so modifications made by other DFS clients surface quickly.
const KERNEL_TTL: Duration = Duration::from_secs(1);

const MAX_READAHEAD: u32 = 64 * 1024;

pub struct HopsFuse {
    fs: Arc<Filesystem>,
    runtime: tokio::runtime::Handle,
}

impl HopsFuse {
    pub fn new(fs: Arc<Filesystem>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }

    fn spawn<Fut>(&self, span: tracing::Span, task: impl FnOnce(Arc<Filesystem>) -> Fut + Send + 'static)
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(task(fs).instrument(span));
    }

    /// Open-reply flags: without the kernel page cache every open is
    /// direct-IO so external modifications stay visible.
    fn open_flags(fs: &Filesystem) -> u32 {
        if fs.config.enable_page_cache {
            0
        } else {
            fuser::consts::FOPEN_DIRECT_IO
        }
    }
}

fn dir_of(fs: &Filesystem, ino: u64) -> Result<Arc<DirNode>, FsError> {
    fs.node(ino)
        .ok_or(FsError::NotFound)?
        .as_dir()
        .cloned()
        .ok_or(FsError::NotFound)
}

fn file_of(fs: &Filesystem, ino: u64) -> Result<Arc<FileNode>, FsError> {
    fs.node(ino)
        .ok_or(FsError::NotFound)?
        .as_file()
        .cloned()
        .ok_or(FsError::NotFound)
}

async fn handle_of(fs: &Filesystem, ino: u64, fh: u64) -> Result<Arc<FileHandle>, FsError> {
    let file = file_of(fs, ino)?;
    file.find_handle(fh).await.ok_or(FsError::BadHandle)
}

impl fuser::Filesystem for HopsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(e) = config.set_max_readahead(MAX_READAHEAD) {
            warn!(error = ?e, "could not set max readahead");
        }
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy().into_owned();
        let span = tracing::debug_span!("fuse::lookup", parent, name = %name);
        self.spawn(span, move |fs| async move {
            let result = async {
                let dir = dir_of(&fs, parent)?;
                dir.lookup(&name).await
            }
            .await;
            match result {
                Ok(node) => reply.entry(&KERNEL_TTL, &node.attrs().to_fuse(), 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let span = tracing::debug_span!("fuse::getattr", ino);
        self.spawn(span, move |fs| async move {
            let result = async {
                match fs.node(ino).ok_or(FsError::NotFound)? {
                    Inode::Dir(dir) => dir.getattr().await,
                    Inode::File(file) => file.getattr().await,
                }
            }
            .await;
            match result {
                Ok(attr) => reply.attr(&KERNEL_TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser callback")]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetattrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        let span = tracing::debug_span!("fuse::setattr", ino);
        self.spawn(span, move |fs| async move {
            let result = async {
                match fs.node(ino).ok_or(FsError::NotFound)? {
                    Inode::Dir(dir) => dir.setattr(changes).await,
                    Inode::File(file) => file.setattr(changes).await,
                }
            }
            .await;
            match result {
                Ok(attr) => reply.attr(&KERNEL_TTL, &attr),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let span = tracing::debug_span!("fuse::readdir", ino, offset);
        self.spawn(span, move |fs| async move {
            let dir = match dir_of(&fs, ino) {
                Ok(dir) => dir,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };
            let parent_ino = dir
                .parent
                .lock()
                .as_ref()
                .and_then(std::sync::Weak::upgrade)
                .map_or(ino, |p| p.ino);

            let entries = match dir.readdir().await {
                Ok(entries) => entries,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };

            let mut listing: Vec<(u64, fuser::FileType, String)> =
                Vec::with_capacity(entries.len() + 2);
            listing.push((ino, fuser::FileType::Directory, ".".to_owned()));
            listing.push((parent_ino, fuser::FileType::Directory, "..".to_owned()));
            listing.extend(entries.into_iter().map(|e| (e.ino, e.kind, e.name)));

            let mut index = 0i64;
            for (entry_ino, kind, name) in listing {
                index += 1;
                if index <= offset {
                    continue;
                }
                if reply.add(entry_ino, index, kind, &name) {
                    break; // reply buffer full; the kernel asks again
                }
            }
            reply.ok();
        });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy().into_owned();
        let (uid, gid) = (req.uid(), req.gid());
        let span = tracing::debug_span!("fuse::mkdir", parent, name = %name);
        self.spawn(span, move |fs| async move {
            let result = async {
                let dir = dir_of(&fs, parent)?;
                dir.mkdir(&name, mode & 0o7777, uid, gid).await
            }
            .await;
            match result {
                Ok(node) => reply.entry(&KERNEL_TTL, &node.attrs().to_fuse(), 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy().into_owned();
        let (uid, gid) = (req.uid(), req.gid());
        let span = tracing::debug_span!("fuse::create", parent, name = %name);
        self.spawn(span, move |fs| async move {
            let result = async {
                let dir = dir_of(&fs, parent)?;
                dir.create(&name, mode & 0o7777, flags, uid, gid).await
            }
            .await;
            match result {
                Ok((file, handle)) => {
                    let attr = file.attrs.lock().to_fuse();
                    reply.created(&KERNEL_TTL, &attr, 0, handle.id(), Self::open_flags(&fs));
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let span = tracing::debug_span!("fuse::open", ino, flags);
        self.spawn(span, move |fs| async move {
            let result = async {
                let file = file_of(&fs, ino)?;
                file.open(flags).await
            }
            .await;
            match result {
                Ok(handle) => reply.opened(handle.id(), Self::open_flags(&fs)),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser callback")]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let span = tracing::debug_span!("fuse::read", ino, fh, offset, size);
        self.spawn(span, move |fs| async move {
            if offset < 0 {
                reply.error(libc::EINVAL);
                return;
            }
            let result = async {
                let handle = handle_of(&fs, ino, fh).await?;
                handle.read(offset as u64, size).await
            }
            .await;
            match result {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the fuser callback")]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let span = tracing::debug_span!("fuse::write", ino, fh, offset, size = data.len());
        self.spawn(span, move |fs| async move {
            if offset < 0 {
                reply.error(libc::EINVAL);
                return;
            }
            let result = async {
                let handle = handle_of(&fs, ino, fh).await?;
                handle.write(offset as u64, &data).await
            }
            .await;
            match result {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let span = tracing::debug_span!("fuse::flush", ino, fh);
        self.spawn(span, move |fs| async move {
            let result = async {
                let handle = handle_of(&fs, ino, fh).await?;
                handle.flush().await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let span = tracing::debug_span!("fuse::fsync", ino, fh);
        self.spawn(span, move |fs| async move {
            let result = async {
                let file = file_of(&fs, ino)?;
                file.fsync().await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::fsyncdir", ino);
        self.spawn(span, move |fs| async move {
            match dir_of(&fs, ino) {
                Ok(dir) => {
                    let _ = dir.fsync().await;
                    reply.ok();
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        flush: bool,
        reply: ReplyEmpty,
    ) {
        let span = tracing::debug_span!("fuse::release", ino, fh);
        self.spawn(span, move |fs| async move {
            let result = async {
                let handle = handle_of(&fs, ino, fh).await?;
                if flush {
                    // A failed final flush must not be silent data loss.
                    handle.flush().await?;
                }
                handle.release().await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => {
                    error!(ino, fh, error = %e, "release failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        let span = tracing::debug_span!("fuse::unlink", parent, name = %name);
        self.spawn(span, move |fs| async move {
            let result = async {
                let dir = dir_of(&fs, parent)?;
                dir.remove(&name).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy().into_owned();
        let span = tracing::debug_span!("fuse::rmdir", parent, name = %name);
        self.spawn(span, move |fs| async move {
            let result = async {
                let dir = dir_of(&fs, parent)?;
                dir.remove(&name).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy().into_owned();
        let newname = newname.to_string_lossy().into_owned();
        let span = tracing::debug_span!("fuse::rename", parent, name = %name, newparent, newname = %newname);
        self.spawn(span, move |fs| async move {
            if flags & (libc::RENAME_EXCHANGE | libc::RENAME_WHITEOUT) != 0 {
                error!(flags, "unsupported rename flags");
                reply.error(libc::EINVAL);
                return;
            }
            let options = if flags & libc::RENAME_NOREPLACE != 0 {
                crate::fs::dfs::RenameOptions::NoReplace
            } else {
                crate::fs::dfs::RenameOptions::None
            };
            let result = async {
                let src = dir_of(&fs, parent)?;
                let dst = dir_of(&fs, newparent)?;
                src.rename(&name, &dst, &newname, options).await
            }
            .await;
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let span = tracing::debug_span!("fuse::statfs");
        self.spawn(span, move |fs| async move {
            match fs.statfs().await {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.bfree,
                    stat.bavail,
                    0,
                    0,
                    stat.block_size,
                    255,
                    stat.block_size,
                ),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        error!(parent, name = %name.to_string_lossy(), "symlink is not supported");
        reply.error(libc::ENOTSUP);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        error!(ino, "readlink is not supported");
        reply.error(libc::ENOTSUP);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        error!(ino, newparent, "hard links are not supported");
        reply.error(libc::ENOTSUP);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        // Liveness is tracked by the parent's children map; see the node
        // comments for why forget must not drop inodes here.
        debug!(ino, nlookup, "forget ignored");
    }
}

/// Mount options for the session.
pub fn mount_options(fs_name: &str, read_only: bool, allow_other: bool) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName(fs_name.to_owned()),
        fuser::MountOption::Subtype("hopsfs".to_owned()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::NoDev,
        fuser::MountOption::NoSuid,
    ];
    if allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if read_only {
        options.push(fuser::MountOption::RO);
    } else {
        options.push(fuser::MountOption::RW);
    }
    options
}
