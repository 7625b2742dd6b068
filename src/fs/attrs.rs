//! Cached inode attributes and their FUSE representation.

use std::time::{Duration, SystemTime};

use crate::fs::clock::Clock;

/// How long a cached stat result stays fresh.
pub const STAT_TTL: Duration = Duration::from_secs(5);

/// Attributes common to file and directory nodes, as cached from the DFS.
#[derive(Debug, Clone)]
pub struct Attrs {
    /// Kernel-visible inode number, assigned by the inode table.
    pub ino: u64,
    /// Base name of the entry within its parent.
    pub name: String,
    /// Permission bits.
    pub mode: u32,
    pub is_dir: bool,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// Owner as known to the DFS, used for chown round-trips.
    pub dfs_user: String,
    pub dfs_group: String,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Moment past which this record must be refreshed. `None` never expires
    /// (the root directory is authoritative).
    pub expires: Option<SystemTime>,
}

impl Attrs {
    pub fn expired(&self, now: SystemTime) -> bool {
        match self.expires {
            None => false,
            Some(expires) => now > expires,
        }
    }

    /// Mark the record fresh for [`STAT_TTL`] from `now`.
    pub fn touch(&mut self, now: SystemTime) {
        self.expires = Some(now + STAT_TTL);
    }

    /// Force the next query to refresh from the DFS.
    pub fn invalidate(&mut self, clock: &dyn Clock) {
        self.expires = Some(clock.now() - Duration::from_secs(1));
    }

    pub fn kind(&self) -> fuser::FileType {
        if self.is_dir {
            fuser::FileType::Directory
        } else {
            fuser::FileType::RegularFile
        }
    }

    pub fn to_fuse(&self) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: if self.is_dir { 0 } else { self.size },
            blocks: self.size.div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: self.kind(),
            perm: (self.mode & 0o7777) as u16,
            nlink: if self.is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// DFS capacity usage as reported by the name node.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInfo {
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}
