//! Shared test fixtures: an in-memory DFS client with failure injection and
//! RPC counters, plus a filesystem constructor wired to the mock clock.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use hopsfs_mount::fs::attrs::{Attrs, FsInfo};
use hopsfs_mount::fs::clock::{Clock, MockClock};
use hopsfs_mount::fs::dfs::{DfsClient, DfsReader, DfsWriter, RenameOptions};
use hopsfs_mount::fs::error::FsError;
use hopsfs_mount::fs::idcache::{IdentityCache, IdentityConfig, UserDatabase};
use hopsfs_mount::fs::retry::RetryPolicy;
use hopsfs_mount::fs::{Filesystem, MountConfig};

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub is_dir: bool,
    pub mode: u32,
    pub data: Vec<u8>,
    pub user: String,
    pub group: String,
}

impl MockEntry {
    pub fn dir() -> Self {
        Self {
            is_dir: true,
            mode: 0o755,
            data: Vec::new(),
            user: "hdfs".into(),
            group: "hadoop".into(),
        }
    }

    pub fn file(data: &[u8]) -> Self {
        Self {
            is_dir: false,
            mode: 0o644,
            data: data.to_vec(),
            user: "hdfs".into(),
            group: "hadoop".into(),
        }
    }
}

#[derive(Default)]
pub struct Counters {
    pub stat: u64,
    pub read_dir: u64,
    pub open_read: u64,
    pub create: u64,
    pub mkdir: u64,
    pub remove: u64,
    pub rename: u64,
    pub chown: u64,
    pub chmod: u64,
    pub close: u64,
}

pub struct MockState {
    pub entries: BTreeMap<String, MockEntry>,
    pub counters: Counters,
    /// Error returned by chown calls while set.
    pub fail_chown: Option<FsError>,
    /// Number of upcoming reads that fail with a retriable error.
    pub failing_reads: u32,
}

impl MockState {
    fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_owned(), MockEntry::dir());
        Self {
            entries,
            counters: Counters::default(),
            fail_chown: None,
            failing_reads: 0,
        }
    }
}

pub struct MockDfs {
    pub state: Arc<Mutex<MockState>>,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn attrs_for(path: &str, entry: &MockEntry) -> Attrs {
    Attrs {
        ino: 0,
        name: basename(path).to_owned(),
        mode: entry.mode,
        is_dir: entry.is_dir,
        size: entry.data.len() as u64,
        uid: 1000,
        gid: 1000,
        dfs_user: entry.user.clone(),
        dfs_group: entry.group.clone(),
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        expires: None,
    }
}

/// Direct children of `dir` within the path-keyed map.
fn children_of(state: &MockState, dir: &str) -> Vec<(String, MockEntry)> {
    let prefix = if dir == "/" {
        "/".to_owned()
    } else {
        format!("{dir}/")
    };
    state
        .entries
        .iter()
        .filter(|(path, _)| {
            path.starts_with(&prefix)
                && path.as_str() != dir
                && !path[prefix.len()..].contains('/')
                && !path[prefix.len()..].is_empty()
        })
        .map(|(path, entry)| (path.clone(), entry.clone()))
        .collect()
}

struct MockReader {
    state: Arc<Mutex<MockState>>,
    path: String,
    pos: u64,
}

#[async_trait]
impl DfsReader for MockReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut state = self.state.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(FsError::Io("injected read failure".into()));
        }
        let entry = state.entries.get(&self.path).ok_or(FsError::NotFound)?;
        let pos = self.pos as usize;
        if pos >= entry.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(entry.data.len() - pos);
        buf[..n].copy_from_slice(&entry.data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, pos: u64) -> Result<(), FsError> {
        self.pos = pos;
        Ok(())
    }

    async fn position(&mut self) -> Result<u64, FsError> {
        Ok(self.pos)
    }

    async fn close(&mut self) -> Result<(), FsError> {
        Ok(())
    }
}

struct MockWriter {
    state: Arc<Mutex<MockState>>,
    path: String,
    buf: Vec<u8>,
    mode: u32,
}

#[async_trait]
impl DfsWriter for MockWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), FsError> {
        let mut state = self.state.lock();
        let data = std::mem::take(&mut self.buf);
        let mode = self.mode;
        let entry = state
            .entries
            .entry(self.path.clone())
            .or_insert_with(|| MockEntry::file(&[]));
        entry.data = data;
        entry.mode = mode;
        Ok(())
    }
}

#[async_trait]
impl DfsClient for MockDfs {
    async fn ensure_connected(&self) -> Result<(), FsError> {
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn DfsReader>, FsError> {
        let mut state = self.state.lock();
        state.counters.open_read += 1;
        if !state.entries.contains_key(path) {
            return Err(FsError::NotFound);
        }
        Ok(Box::new(MockReader {
            state: self.state.clone(),
            path: path.to_owned(),
            pos: 0,
        }))
    }

    async fn create_file(
        &self,
        path: &str,
        mode: u32,
        overwrite: bool,
    ) -> Result<Box<dyn DfsWriter>, FsError> {
        let mut state = self.state.lock();
        state.counters.create += 1;
        if !overwrite && state.entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        state.entries.insert(
            path.to_owned(),
            MockEntry {
                mode,
                ..MockEntry::file(&[])
            },
        );
        Ok(Box::new(MockWriter {
            state: self.state.clone(),
            path: path.to_owned(),
            buf: Vec::new(),
            mode,
        }))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<Attrs>, FsError> {
        let mut state = self.state.lock();
        state.counters.read_dir += 1;
        if !state.entries.get(path).is_some_and(|e| e.is_dir) {
            return Err(FsError::NotFound);
        }
        Ok(children_of(&state, path)
            .into_iter()
            .map(|(child_path, entry)| attrs_for(&child_path, &entry))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Attrs, FsError> {
        let mut state = self.state.lock();
        state.counters.stat += 1;
        state
            .entries
            .get(path)
            .map(|entry| attrs_for(path, entry))
            .ok_or(FsError::NotFound)
    }

    async fn statfs(&self) -> Result<FsInfo, FsError> {
        let used: u64 = {
            let state = self.state.lock();
            state.entries.values().map(|e| e.data.len() as u64).sum()
        };
        let capacity = 1 << 30;
        Ok(FsInfo {
            capacity,
            used,
            remaining: capacity - used,
        })
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.counters.mkdir += 1;
        if state.entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        state.entries.insert(
            path.to_owned(),
            MockEntry {
                mode,
                ..MockEntry::dir()
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.counters.remove += 1;
        if state.entries.remove(path).is_none() {
            return Err(FsError::NotFound);
        }
        let prefix = format!("{path}/");
        state.entries.retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str, options: RenameOptions) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.counters.rename += 1;
        if !state.entries.contains_key(old) {
            return Err(FsError::NotFound);
        }
        if state.entries.contains_key(new) && options == RenameOptions::NoReplace {
            return Err(FsError::AlreadyExists);
        }
        let prefix = format!("{old}/");
        let moved: Vec<(String, MockEntry)> = state
            .entries
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        for (p, _) in &moved {
            state.entries.remove(p);
        }
        for (p, e) in moved {
            let relocated = format!("{new}{}", &p[old.len()..]);
            state.entries.insert(relocated, e);
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.counters.chmod += 1;
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.mode = mode;
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    async fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), FsError> {
        let mut state = self.state.lock();
        state.counters.chown += 1;
        if let Some(err) = state.fail_chown.clone() {
            return Err(err);
        }
        match state.entries.get_mut(path) {
            Some(entry) => {
                entry.user = user.to_owned();
                entry.group = group.to_owned();
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    async fn close(&self) -> Result<(), FsError> {
        self.state.lock().counters.close += 1;
        Ok(())
    }
}

/// Host user database stub so tests never depend on the real /etc/passwd.
pub struct StubUserDb;

impl UserDatabase for StubUserDb {
    fn uid_by_name(&self, name: &str) -> Option<u32> {
        (name == "testuser").then_some(1000)
    }
    fn gid_by_name(&self, name: &str) -> Option<u32> {
        (name == "testgroup").then_some(1000)
    }
    fn name_by_uid(&self, uid: u32) -> Option<String> {
        (uid == 1000).then(|| "testuser".to_owned())
    }
    fn name_by_gid(&self, gid: u32) -> Option<String> {
        (gid == 1000).then(|| "testgroup".to_owned())
    }
    fn current_user(&self) -> Option<String> {
        Some("testuser".to_owned())
    }
}

pub struct TestFs {
    pub fs: Arc<Filesystem>,
    pub state: Arc<Mutex<MockState>>,
    pub clock: Arc<MockClock>,
}

pub fn new_test_fs(prefixes: &[&str]) -> TestFs {
    let clock = Arc::new(MockClock::new());
    let state = Arc::new(Mutex::new(MockState::new()));
    let policy = Arc::new(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(10),
        Duration::from_secs(600),
        clock.clone() as Arc<dyn Clock>,
    ));
    let idcache = Arc::new(IdentityCache::new(
        Box::new(StubUserDb),
        clock.clone() as Arc<dyn Clock>,
    ));
    let config = MountConfig {
        src_dir: "/".to_owned(),
        allowed_prefixes: prefixes.iter().map(|p| (*p).to_owned()).collect(),
        read_only: false,
        stage_dir: std::env::temp_dir(),
        enable_page_cache: false,
        identity: IdentityConfig::default(),
    };
    let fs = Filesystem::new(
        vec![Arc::new(MockDfs {
            state: state.clone(),
        })],
        config,
        policy,
        clock.clone() as Arc<dyn Clock>,
        idcache,
    );
    TestFs { fs, state, clock }
}

/// Seed a DFS entry directly, bypassing the mount.
pub fn seed(state: &Arc<Mutex<MockState>>, path: &str, entry: MockEntry) {
    state.lock().entries.insert(path.to_owned(), entry);
}

pub fn dfs_data(state: &Arc<Mutex<MockState>>, path: &str) -> Option<Vec<u8>> {
    state.lock().entries.get(path).map(|e| e.data.clone())
}
