//! The filesystem mediation engine between the kernel VFS layer and the
//! remote DFS.
//!
//! [`Filesystem`] owns the shared pieces of a mount: the connector pool, the
//! retry policy, the identity cache, the allow-list, and the table mapping
//! kernel inode numbers to live nodes. The nodes themselves live in
//! [`dir`] and [`file`]; open-file state lives in [`handle`] and [`proxy`].

pub mod attrs;
pub mod clock;
pub mod dfs;
pub mod dir;
pub mod error;
pub mod fault_tolerant;
pub mod file;
pub mod handle;
pub mod hopsfs;
pub mod idcache;
pub mod proxy;
pub mod reader;
pub mod reader_pool;
pub mod retry;
pub mod setattr;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::fs::attrs::Attrs;
use crate::fs::clock::Clock;
use crate::fs::dfs::{DfsClient, DfsClientPool};
use crate::fs::dir::DirNode;
use crate::fs::error::FsError;
use crate::fs::file::FileNode;
use crate::fs::idcache::{IdentityCache, IdentityConfig};
use crate::fs::retry::RetryPolicy;

/// The kernel's fixed inode number for the mount root.
pub const ROOT_INO: u64 = 1;

/// A live node in the tree.
#[derive(Clone)]
pub enum Inode {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inode::Dir(d) => f.debug_tuple("Dir").field(&d.ino).finish(),
            Inode::File(n) => f.debug_tuple("File").field(&n.ino).finish(),
        }
    }
}

impl Inode {
    pub fn ino(&self) -> u64 {
        match self {
            Self::Dir(d) => d.ino,
            Self::File(f) => f.ino,
        }
    }

    pub fn attrs(&self) -> Attrs {
        match self {
            Self::Dir(d) => d.attrs.lock().clone(),
            Self::File(f) => f.attrs.lock().clone(),
        }
    }

    pub fn as_dir(&self) -> Option<&Arc<DirNode>> {
        match self {
            Self::Dir(d) => Some(d),
            Self::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileNode>> {
        match self {
            Self::File(f) => Some(f),
            Self::Dir(_) => None,
        }
    }
}

/// Mount-wide settings loaded once at startup.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// DFS directory projected at the mount root.
    pub src_dir: String,
    /// Path prefixes exposed through the mount; `*` matches everything.
    pub allowed_prefixes: Vec<String>,
    pub read_only: bool,
    /// Directory holding the anonymous staging files.
    pub stage_dir: PathBuf,
    /// When false (the default) every open carries the direct-IO hint so the
    /// kernel page cache stays out of the way of externally-modified files.
    pub enable_page_cache: bool,
    pub identity: IdentityConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            src_dir: "/".to_owned(),
            allowed_prefixes: vec!["*".to_owned()],
            read_only: false,
            stage_dir: PathBuf::from("/tmp"),
            enable_page_cache: false,
            identity: IdentityConfig::default(),
        }
    }
}

/// Block counts reported to `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
}

pub struct Filesystem {
    pool: DfsClientPool,
    pub(crate) policy: Arc<RetryPolicy>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: MountConfig,
    pub(crate) idcache: Arc<IdentityCache>,
    /// Kernel ino → node. Entries are *not* dropped on kernel `forget`: a
    /// stale forget arriving after a re-create would otherwise tear down a
    /// live inode. The parent's children map is the liveness signal.
    nodes: RwLock<HashMap<u64, Inode>>,
    next_ino: AtomicU64,
    root: RwLock<Option<Arc<DirNode>>>,
}

impl Filesystem {
    pub fn new(
        connectors: Vec<Arc<dyn DfsClient>>,
        config: MountConfig,
        policy: Arc<RetryPolicy>,
        clock: Arc<dyn Clock>,
        idcache: Arc<IdentityCache>,
    ) -> Arc<Self> {
        let fs = Arc::new(Self {
            pool: DfsClientPool::new(connectors),
            policy,
            clock,
            config,
            idcache,
            nodes: RwLock::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            root: RwLock::new(None),
        });

        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();
        let root = DirNode::new_root(Arc::downgrade(&fs), uid, gid, fs.clock.now());
        fs.nodes.write().insert(ROOT_INO, Inode::Dir(root.clone()));
        *fs.root.write() = Some(root);
        fs
    }

    /// The singleton root directory.
    pub fn root(&self) -> Arc<DirNode> {
        self.root
            .read()
            .clone()
            .unwrap_or_else(|| unreachable!("root is set in Filesystem::new"))
    }

    /// Next connector from the round-robin pool.
    pub fn get_connector(&self) -> Arc<dyn DfsClient> {
        self.pool.get_connector()
    }

    pub(crate) fn allocate_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_node(&self, node: Inode) {
        self.nodes.write().insert(node.ino(), node);
    }

    /// Resolve a kernel inode number.
    pub fn node(&self, ino: u64) -> Option<Inode> {
        self.nodes.read().get(&ino).cloned()
    }

    /// Whether `path` is visible through the configured prefix allow-list.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        for prefix in &self.config.allowed_prefixes {
            if prefix == "*" {
                return true;
            }
            let prefixed = format!("/{prefix}");
            if path == prefixed || path.starts_with(&format!("{prefixed}/")) {
                return true;
            }
        }
        false
    }

    pub async fn statfs(&self) -> Result<StatFs, FsError> {
        let info = match self.get_connector().statfs().await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "statfs on DFS failed");
                return Err(e);
            }
        };
        let block_size = 1024u32;
        let bfree = info.remaining / u64::from(block_size);
        Ok(StatFs {
            block_size,
            blocks: info.capacity / u64::from(block_size),
            bfree,
            bavail: bfree,
        })
    }

    /// Unmount via the external fusermount tool and close every connector.
    pub async fn unmount(&self, mountpoint: &std::path::Path) {
        info!(mountpoint = %mountpoint.display(), "unmounting");
        match tokio::process::Command::new("fusermount3")
            .arg("-zu")
            .arg(mountpoint)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%status, "fusermount3 exited with failure"),
            Err(e) => warn!(error = %e, "could not run fusermount3"),
        }
        self.pool.close_all().await;
    }

    /// Stop in-flight retries promptly (signal path).
    pub fn shut_down_retries(&self) {
        self.policy.shut_down();
    }
}

/// Join a DFS directory path and a child name.
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
