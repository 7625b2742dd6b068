//! Shared setattr plumbing for directory and file nodes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::fs::attrs::Attrs;
use crate::fs::error::FsError;
use crate::fs::idcache::{group_name_for, user_name_for};
use crate::fs::Filesystem;

/// The subset of a kernel setattr request this filesystem acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<fuser::TimeOrNow>,
    pub mtime: Option<fuser::TimeOrNow>,
}

/// Push a chmod to the DFS and mirror it into the cached attrs.
pub(crate) async fn chmod_op(
    fs: &Arc<Filesystem>,
    attrs: &Mutex<Attrs>,
    path: &str,
    mode: u32,
) -> Result<(), FsError> {
    info!(path, mode = %format_args!("{mode:o}"), "chmod");
    fs.get_connector().chmod(path, mode).await?;
    attrs.lock().mode = mode;
    Ok(())
}

/// Push a chown/chgrp to the DFS, resolving names through the identity
/// cache, and mirror it into the cached attrs.
pub(crate) async fn chown_op(
    fs: &Arc<Filesystem>,
    attrs: &Mutex<Attrs>,
    path: &str,
    new_uid: Option<u32>,
    new_gid: Option<u32>,
) -> Result<(), FsError> {
    let (uid, gid) = {
        let attrs = attrs.lock();
        (
            new_uid.unwrap_or(attrs.uid),
            new_gid.unwrap_or(attrs.gid),
        )
    };

    let user = user_name_for(&fs.idcache, &fs.config.identity, uid)?;
    let group = group_name_for(&fs.idcache, &fs.config.identity, path, gid)?;

    info!(path, uid, %user, gid, %group, "chown");
    fs.get_connector().chown(path, &user, &group).await?;

    let mut attrs = attrs.lock();
    attrs.uid = uid;
    attrs.gid = gid;
    attrs.dfs_user = user;
    attrs.dfs_group = group;
    Ok(())
}

/// Record timestamp updates. The DFS stat carries no access time, so atime
/// changes are acknowledged without effect; mtime is kept in the cache.
pub(crate) fn update_times(fs: &Arc<Filesystem>, attrs: &Mutex<Attrs>, changes: &SetattrChanges) {
    if changes.atime.is_some() {
        debug!("atime updates are ignored, the DFS does not track access time");
    }
    if let Some(mtime) = changes.mtime {
        let when = match mtime {
            fuser::TimeOrNow::SpecificTime(t) => t,
            fuser::TimeOrNow::Now => fs.clock.now(),
        };
        attrs.lock().mtime = when;
    }
}

/// Apply the non-size parts of a setattr request to `path`.
pub(crate) async fn apply_common(
    fs: &Arc<Filesystem>,
    attrs: &Mutex<Attrs>,
    path: &str,
    changes: &SetattrChanges,
) -> Result<(), FsError> {
    if let Some(mode) = changes.mode {
        if let Err(e) = chmod_op(fs, attrs, path, mode).await {
            warn!(path, error = %e, "setattr chmod failed");
            return Err(e);
        }
    }

    if changes.uid.is_some() || changes.gid.is_some() {
        if let Err(e) = chown_op(fs, attrs, path, changes.uid, changes.gid).await {
            warn!(path, error = %e, "setattr chown failed");
            return Err(e);
        }
    }

    update_times(fs, attrs, changes);
    Ok(())
}
