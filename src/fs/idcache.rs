//! Time-bounded cache of user/group name↔id mappings.
//!
//! The DFS speaks names while the kernel speaks numeric ids; every stat and
//! chown crosses that boundary. Lookups hit the host user database on miss
//! and cache positive results for a few seconds. Negative results map to the
//! zero value and are deliberately not cached, so a user created mid-flight
//! becomes visible on the next call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::warn;

use crate::fs::clock::Clock;
use crate::fs::error::FsError;

/// How long a resolved mapping stays fresh.
pub const IDENTITY_TTL: Duration = Duration::from_secs(3);

/// Seam over the host OS user database.
pub trait UserDatabase: Send + Sync {
    fn uid_by_name(&self, name: &str) -> Option<u32>;
    fn gid_by_name(&self, name: &str) -> Option<u32>;
    fn name_by_uid(&self, uid: u32) -> Option<String>;
    fn name_by_gid(&self, gid: u32) -> Option<String>;
    fn current_user(&self) -> Option<String>;
}

/// The real host database, via `nix`.
pub struct NixUserDatabase;

impl UserDatabase for NixUserDatabase {
    fn uid_by_name(&self, name: &str) -> Option<u32> {
        nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
    }

    fn gid_by_name(&self, name: &str) -> Option<u32> {
        nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }

    fn name_by_uid(&self, uid: u32) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }

    fn name_by_gid(&self, gid: u32) -> Option<String> {
        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
    }

    fn current_user(&self) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::current())
            .ok()
            .flatten()
            .map(|u| u.name)
    }
}

struct Entry<T> {
    value: T,
    expires: SystemTime,
}

#[derive(Default)]
struct Maps {
    uid_by_name: HashMap<String, Entry<u32>>,
    gid_by_name: HashMap<String, Entry<u32>>,
    name_by_uid: HashMap<u32, Entry<String>>,
    name_by_gid: HashMap<u32, Entry<String>>,
}

pub struct IdentityCache {
    db: Box<dyn UserDatabase>,
    clock: Arc<dyn Clock>,
    maps: Mutex<Maps>,
}

impl IdentityCache {
    pub fn new(db: Box<dyn UserDatabase>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Numeric uid for `name`, or 0 when unknown.
    pub fn lookup_uid(&self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let now = self.clock.now();
        {
            let maps = self.maps.lock();
            if let Some(entry) = maps.uid_by_name.get(name) {
                if now < entry.expires {
                    return entry.value;
                }
            }
        }
        match self.db.uid_by_name(name) {
            Some(uid) => {
                self.maps.lock().uid_by_name.insert(
                    name.to_owned(),
                    Entry {
                        value: uid,
                        expires: now + IDENTITY_TTL,
                    },
                );
                uid
            }
            None => 0,
        }
    }

    /// Numeric gid for `name`, or 0 when unknown.
    pub fn lookup_gid(&self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        let now = self.clock.now();
        {
            let maps = self.maps.lock();
            if let Some(entry) = maps.gid_by_name.get(name) {
                if now < entry.expires {
                    return entry.value;
                }
            }
        }
        match self.db.gid_by_name(name) {
            Some(gid) => {
                self.maps.lock().gid_by_name.insert(
                    name.to_owned(),
                    Entry {
                        value: gid,
                        expires: now + IDENTITY_TTL,
                    },
                );
                gid
            }
            None => 0,
        }
    }

    /// User name for `uid`, or the empty string when unknown.
    pub fn lookup_user_name(&self, uid: u32) -> String {
        let now = self.clock.now();
        {
            let maps = self.maps.lock();
            if let Some(entry) = maps.name_by_uid.get(&uid) {
                if now < entry.expires {
                    return entry.value.clone();
                }
            }
        }
        match self.db.name_by_uid(uid) {
            Some(name) => {
                self.maps.lock().name_by_uid.insert(
                    uid,
                    Entry {
                        value: name.clone(),
                        expires: now + IDENTITY_TTL,
                    },
                );
                name
            }
            None => String::new(),
        }
    }

    /// Group name for `gid`, or the empty string when unknown.
    pub fn lookup_group_name(&self, gid: u32) -> String {
        let now = self.clock.now();
        {
            let maps = self.maps.lock();
            if let Some(entry) = maps.name_by_gid.get(&gid) {
                if now < entry.expires {
                    return entry.value.clone();
                }
            }
        }
        match self.db.name_by_gid(gid) {
            Some(name) => {
                self.maps.lock().name_by_gid.insert(
                    gid,
                    Entry {
                        value: name.clone(),
                        expires: now + IDENTITY_TTL,
                    },
                );
                name
            }
            None => String::new(),
        }
    }

    pub fn current_user(&self) -> Result<String, FsError> {
        self.db.current_user().ok_or_else(|| {
            warn!("could not determine the current user");
            FsError::NotPermitted
        })
    }
}

/// Identity resolution knobs taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    /// When set, every DFS operation is attributed to this user regardless of
    /// the requesting uid.
    pub force_username: Option<String>,
    /// Derive the effective group from `/Projects/<P>/<D>/` path components.
    pub group_from_dataset_path: bool,
}

/// DFS user name for a request issued by `uid`.
pub fn user_name_for(
    cache: &IdentityCache,
    config: &IdentityConfig,
    uid: u32,
) -> Result<String, FsError> {
    if let Some(forced) = &config.force_username {
        if !forced.is_empty() {
            return Ok(forced.clone());
        }
    }
    let name = cache.lookup_user_name(uid);
    if name.is_empty() {
        warn!(uid, "no user name known for uid");
        return Err(FsError::NotPermitted);
    }
    Ok(name)
}

/// DFS group name for a request issued by `gid` against `path`.
pub fn group_name_for(
    cache: &IdentityCache,
    config: &IdentityConfig,
    path: &str,
    gid: u32,
) -> Result<String, FsError> {
    if config.group_from_dataset_path {
        match group_from_dataset_path(path) {
            Some(group) => return Ok(group),
            None => warn!(path, "path does not contain a project dataset, falling back to gid"),
        }
    }
    let name = cache.lookup_group_name(gid);
    if name.is_empty() {
        warn!(gid, "no group name known for gid");
        return Err(FsError::NotPermitted);
    }
    Ok(name)
}

/// `/**/Projects/<P>/<D>/**` → `"<P>__<D>"`.
pub fn group_from_dataset_path(path: &str) -> Option<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"/*Projects/(?P<project>\w+)/(?P<dataset>\w+)(/|$)")
            .unwrap_or_else(|e| unreachable!("static regex must compile: {e}"))
    });
    let caps = re.captures(path)?;
    Some(format!("{}__{}", &caps["project"], &caps["dataset"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::clock::MockClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDb {
        lookups: Arc<AtomicU32>,
        known_uid: Option<u32>,
    }

    impl UserDatabase for CountingDb {
        fn uid_by_name(&self, _name: &str) -> Option<u32> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.known_uid
        }
        fn gid_by_name(&self, _name: &str) -> Option<u32> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.known_uid
        }
        fn name_by_uid(&self, uid: u32) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.known_uid.filter(|&k| k == uid).map(|_| "alice".into())
        }
        fn name_by_gid(&self, _gid: u32) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            None
        }
        fn current_user(&self) -> Option<String> {
            Some("alice".into())
        }
    }

    fn cache(known_uid: Option<u32>) -> (IdentityCache, Arc<MockClock>, Arc<AtomicU32>) {
        let clock = Arc::new(MockClock::new());
        let lookups = Arc::new(AtomicU32::new(0));
        let cache = IdentityCache::new(
            Box::new(CountingDb {
                lookups: lookups.clone(),
                known_uid,
            }),
            clock.clone(),
        );
        (cache, clock, lookups)
    }

    #[test]
    fn positive_lookup_is_cached() {
        let (cache, _clock, lookups) = cache(Some(1234));
        assert_eq!(cache.lookup_uid("alice"), 1234);
        assert_eq!(cache.lookup_uid("alice"), 1234);
        assert_eq!(
            lookups.load(Ordering::SeqCst),
            1,
            "second lookup must come from cache"
        );
    }

    #[test]
    fn cached_entry_expires() {
        let (cache, clock, lookups) = cache(Some(1234));
        assert_eq!(cache.lookup_uid("alice"), 1234);
        clock.advance(IDENTITY_TTL + Duration::from_secs(1));
        assert_eq!(cache.lookup_uid("alice"), 1234);
        assert_eq!(
            lookups.load(Ordering::SeqCst),
            2,
            "expired entry must requery the db"
        );
    }

    #[test]
    fn negative_lookup_is_not_cached() {
        let (cache, _clock, lookups) = cache(None);
        assert_eq!(cache.lookup_uid("ghost"), 0);
        assert_eq!(cache.lookup_uid("ghost"), 0);
        assert_eq!(
            lookups.load(Ordering::SeqCst),
            2,
            "negative results are never cached"
        );
    }

    #[test]
    fn empty_name_maps_to_zero_without_db_hit() {
        let (cache, _clock, lookups) = cache(Some(1));
        assert_eq!(cache.lookup_uid(""), 0);
        assert_eq!(cache.lookup_gid(""), 0);
        assert_eq!(lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forced_username_wins() {
        let (cache, _clock, _lookups) = cache(None);
        let config = IdentityConfig {
            force_username: Some("hopsuser".into()),
            group_from_dataset_path: false,
        };
        assert_eq!(user_name_for(&cache, &config, 4242).unwrap(), "hopsuser");
    }

    #[test]
    fn dataset_path_group() {
        assert_eq!(
            group_from_dataset_path("/Projects/demo/raw/inner/file.csv").as_deref(),
            Some("demo__raw")
        );
        assert_eq!(
            group_from_dataset_path("/Projects/p1/ds1").as_deref(),
            Some("p1__ds1")
        );
        assert_eq!(group_from_dataset_path("/user/alice/file"), None);
    }
}
