//! End-to-end scenarios against the mock DFS: create/write/read round trips,
//! truncate semantics, cache behaviour and the proxy lifecycle.

mod common;

use common::{dfs_data, new_test_fs, seed, MockEntry};
use hopsfs_mount::fs::attrs::STAT_TTL;
use hopsfs_mount::fs::error::FsError;
use std::time::Duration;

const O_RDONLY: i32 = libc::O_RDONLY;
const O_WRONLY: i32 = libc::O_WRONLY;
const O_RDWR: i32 = libc::O_RDWR;

#[tokio::test]
async fn create_write_read_roundtrip() {
    let t = new_test_fs(&["*"]);
    let root = t.fs.root();

    // Create /t with mode 0600 and write two bytes.
    let (_file, handle) = root.create("t", 0o600, O_WRONLY, 1000, 1000).await.unwrap();
    assert_eq!(handle.write(0, &[0x68, 0x69]).await.unwrap(), 2);
    handle.flush().await.unwrap();
    handle.release().await.unwrap();

    assert_eq!(dfs_data(&t.state, "/t").unwrap(), vec![0x68, 0x69]);

    // Reopen read-only and read back.
    let node = root.lookup("t").await.unwrap();
    let file = node.as_file().unwrap().clone();
    let handle = file.open(O_RDONLY).await.unwrap();
    let data = handle.read(0, 2).await.unwrap();
    assert_eq!(&data[..], &[0x68, 0x69]);
    handle.release().await.unwrap();

    let attr = file.getattr().await.unwrap();
    assert_eq!(attr.size, 2);
}

#[tokio::test]
async fn truncate_beyond_size_zero_extends() {
    const MIB: u64 = 1 << 20;
    let t = new_test_fs(&["*"]);
    let root = t.fs.root();

    let (_file, handle) = root.create("t", 0o644, O_WRONLY, 1000, 1000).await.unwrap();
    handle.truncate(MIB).await.unwrap();
    handle.flush().await.unwrap();
    handle.release().await.unwrap();

    let uploaded = dfs_data(&t.state, "/t").unwrap();
    assert_eq!(uploaded.len() as u64, MIB);
    assert!(uploaded.iter().all(|&b| b == 0), "extension must be zeros");

    let node = t.fs.root().lookup("t").await.unwrap();
    let file = node.as_file().unwrap().clone();
    let handle = file.open(O_RDONLY).await.unwrap();
    let data = handle.read(0, MIB as u32).await.unwrap();
    assert_eq!(data.len() as u64, MIB);
    assert!(data.iter().all(|&b| b == 0));
    handle.release().await.unwrap();

    assert_eq!(file.getattr().await.unwrap().size, 1_048_576);
}

#[tokio::test]
async fn mkdir_chown_failure_rolls_back() {
    let t = new_test_fs(&["*"]);
    let root = t.fs.root();

    t.state.lock().fail_chown = Some(FsError::AccessDenied);
    let err = root.mkdir("d", 0o755, 1000, 1000).await.unwrap_err();
    assert_eq!(err, FsError::AccessDenied);
    t.state.lock().fail_chown = None;

    // The half-created directory was removed from the DFS.
    assert!(!t.state.lock().entries.contains_key("/d"));
    assert_eq!(root.lookup("d").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn create_chown_failure_rolls_back() {
    let t = new_test_fs(&["*"]);
    let root = t.fs.root();

    t.state.lock().fail_chown = Some(FsError::AccessDenied);
    let err = root
        .create("t", 0o600, O_WRONLY, 1000, 1000)
        .await
        .unwrap_err();
    assert_eq!(err, FsError::AccessDenied);
    t.state.lock().fail_chown = None;

    assert!(!t.state.lock().entries.contains_key("/t"));
    assert_eq!(root.lookup("t").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn readdir_filters_by_allowed_prefixes() {
    let t = new_test_fs(&["foo", "bar"]);
    for name in ["qux", "foo", "bar", "foobar", "baz"] {
        seed(&t.state, &format!("/{name}"), MockEntry::dir());
    }

    let root = t.fs.root();
    let mut names: Vec<String> = root
        .readdir()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["bar", "foo"]);

    // Filtered names are invisible to lookup as well, even though they
    // exist on the DFS.
    assert_eq!(root.lookup("qux").await.unwrap_err(), FsError::NotFound);
    assert_eq!(root.lookup("foobar").await.unwrap_err(), FsError::NotFound);
    assert!(root.lookup("foo").await.is_ok());
}

#[tokio::test]
async fn readdir_seeds_children_for_lookup() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/a", MockEntry::file(b"abc"));
    seed(&t.state, "/b", MockEntry::file(b"defg"));

    let root = t.fs.root();
    root.readdir().await.unwrap();
    let stats_after_readdir = t.state.lock().counters.stat;

    // Both lookups are cache hits.
    let a = root.lookup("a").await.unwrap();
    let b = root.lookup("b").await.unwrap();
    assert_eq!(t.state.lock().counters.stat, stats_after_readdir);
    assert_eq!(a.attrs().size, 3);
    assert_eq!(b.attrs().size, 4);
}

#[tokio::test]
async fn attribute_cache_honours_ttl() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"12345"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();
    assert_eq!(t.state.lock().counters.stat, 1);

    // Within the TTL: no DFS RPC.
    t.clock.advance(Duration::from_secs(2));
    assert_eq!(file.getattr().await.unwrap().size, 5);
    assert_eq!(t.state.lock().counters.stat, 1);

    // Past the TTL: exactly one refresh.
    t.clock.advance(STAT_TTL);
    seed(&t.state, "/f", MockEntry::file(b"123456789"));
    assert_eq!(file.getattr().await.unwrap().size, 9);
    assert_eq!(t.state.lock().counters.stat, 2);
}

#[tokio::test]
async fn flush_without_writes_is_a_noop() {
    let t = new_test_fs(&["*"]);
    let root = t.fs.root();

    let (_file, handle) = root.create("t", 0o644, O_WRONLY, 1000, 1000).await.unwrap();
    handle.write(0, b"payload").await.unwrap();

    handle.flush().await.unwrap();
    let uploads = t.state.lock().counters.create;

    // No intervening writes: the second flush must not upload again.
    handle.flush().await.unwrap();
    handle.fsync().await.unwrap();
    assert_eq!(t.state.lock().counters.create, uploads);

    // Another write re-arms the upload.
    handle.write(7, b" more").await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(t.state.lock().counters.create, uploads + 1);
    assert_eq!(dfs_data(&t.state, "/t").unwrap(), b"payload more");
    handle.release().await.unwrap();
}

#[tokio::test]
async fn read_only_handle_flush_is_a_noop() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"content"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();
    let handle = file.open(O_RDONLY).await.unwrap();

    let uploads = t.state.lock().counters.create;
    handle.flush().await.unwrap();
    assert_eq!(t.state.lock().counters.create, uploads);
    handle.release().await.unwrap();
}

#[tokio::test]
async fn proxy_lifecycle_follows_handles() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"xyz"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();
    assert!(!file.has_proxy().await, "no handles, no proxy");

    let h1 = file.open(O_RDONLY).await.unwrap();
    assert!(file.has_proxy().await);
    assert!(!file.is_staged().await, "first open is a remote RO stream");

    let h2 = file.open(O_RDONLY).await.unwrap();
    assert_eq!(file.active_handles().await, 2);

    h1.release().await.unwrap();
    assert!(file.has_proxy().await, "proxy survives while a handle remains");

    h2.release().await.unwrap();
    assert!(!file.has_proxy().await, "last release drops the proxy");
}

#[tokio::test]
async fn write_upgrades_remote_proxy_to_staging() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"original content"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();

    // Reader comes first, writer joins: both share one proxy.
    let reader = file.open(O_RDONLY).await.unwrap();
    let writer = file.open(O_RDWR).await.unwrap();
    assert!(!file.is_staged().await);

    let before = reader.read(0, 8).await.unwrap();
    assert_eq!(&before[..], b"original");

    // The first write upgrades the whole file to a staged copy seeded with
    // the remote bytes.
    writer.write(0, b"REWRITTEN").await.unwrap();
    assert!(file.is_staged().await);

    let after = reader.read(0, 16).await.unwrap();
    assert_eq!(&after[..], b"REWRITTENcontent");

    writer.flush().await.unwrap();
    assert_eq!(dfs_data(&t.state, "/f").unwrap(), b"REWRITTENcontent");

    reader.release().await.unwrap();
    writer.release().await.unwrap();
    assert!(!file.has_proxy().await);
}

#[tokio::test]
async fn truncate_on_file_node_reaches_open_handles() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"0123456789"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();
    let handle = file.open(O_RDWR).await.unwrap();

    let changes = hopsfs_mount::fs::setattr::SetattrChanges {
        size: Some(4),
        ..Default::default()
    };
    let attr = file.setattr(changes).await.unwrap();
    assert_eq!(attr.size, 4);
    assert!(file.is_staged().await, "truncate upgrades to staging");

    handle.flush().await.unwrap();
    assert_eq!(dfs_data(&t.state, "/f").unwrap(), b"0123");
    handle.release().await.unwrap();
}

#[tokio::test]
async fn read_survives_transient_stream_failures() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"eventually consistent"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();
    let handle = file.open(O_RDONLY).await.unwrap();

    // Tear the next two stream reads; the fault-tolerant reader must reopen
    // and still deliver the bytes.
    t.state.lock().failing_reads = 2;
    let data = handle.read(0, 10).await.unwrap();
    assert_eq!(&data[..], b"eventually");
    handle.release().await.unwrap();
}

#[tokio::test]
async fn statfs_reports_kilobyte_blocks() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(&[0u8; 2048]));

    let stat = t.fs.statfs().await.unwrap();
    assert_eq!(stat.block_size, 1024);
    assert_eq!(stat.blocks, (1u64 << 30) / 1024);
    assert_eq!(stat.bfree, ((1u64 << 30) - 2048) / 1024);
    assert_eq!(stat.bavail, stat.bfree);
}

#[tokio::test]
async fn allow_list_matching_rules() {
    let t = new_test_fs(&["foo", "bar"]);
    assert!(t.fs.is_path_allowed("/"));
    assert!(t.fs.is_path_allowed("/foo"));
    assert!(t.fs.is_path_allowed("/foo/deep/file"));
    assert!(t.fs.is_path_allowed("/bar"));
    assert!(!t.fs.is_path_allowed("/foobar"));
    assert!(!t.fs.is_path_allowed("/baz"));

    let all = new_test_fs(&["*"]);
    assert!(all.fs.is_path_allowed("/anything/at/all"));
}

#[tokio::test]
async fn remove_drops_child_from_cache() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"x"));

    let root = t.fs.root();
    root.lookup("f").await.unwrap();
    root.remove("f").await.unwrap();

    assert!(!t.state.lock().entries.contains_key("/f"));
    assert_eq!(root.lookup("f").await.unwrap_err(), FsError::NotFound);
}

#[tokio::test]
async fn setattr_size_on_directory_is_not_supported() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/d", MockEntry::dir());

    let root = t.fs.root();
    let node = root.lookup("d").await.unwrap();
    let dir = node.as_dir().unwrap().clone();

    let changes = hopsfs_mount::fs::setattr::SetattrChanges {
        size: Some(0),
        ..Default::default()
    };
    assert_eq!(dir.setattr(changes).await.unwrap_err(), FsError::NotSupported);
}

#[tokio::test]
async fn chmod_and_chown_propagate_to_dfs() {
    let t = new_test_fs(&["*"]);
    seed(&t.state, "/f", MockEntry::file(b"x"));

    let root = t.fs.root();
    let node = root.lookup("f").await.unwrap();
    let file = node.as_file().unwrap().clone();

    let changes = hopsfs_mount::fs::setattr::SetattrChanges {
        mode: Some(0o400),
        uid: Some(1000),
        gid: Some(1000),
        ..Default::default()
    };
    let attr = file.setattr(changes).await.unwrap();
    assert_eq!(attr.perm, 0o400);

    let state = t.state.lock();
    let entry = state.entries.get("/f").unwrap();
    assert_eq!(entry.mode, 0o400);
    assert_eq!(entry.user, "testuser");
    assert_eq!(entry.group, "testgroup");
}
