//! Persistent group records and the pooled store facade.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use super::map::{MapError, MembershipMap, Tier};
use super::pool::MapPool;
use crate::encoding::{hex_element, Element};

/// Errors raised by group stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    /// Underlying filesystem failure.
    Io(#[from] std::io::Error),
    #[error("store record error: {0}")]
    /// Record JSON was malformed.
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    /// Stored map state could not be restored.
    Map(#[from] MapError),
    #[error("unknown map option: {0}")]
    /// Option string contained an unrecognised flag.
    InvalidOption(String),
    #[error("map pool lock poisoned")]
    /// A thread panicked while holding the pool.
    Poisoned,
}

/// Persisted form of a group map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGroup {
    /// Group identifier.
    pub group_id: String,
    /// Map capacity tier.
    pub tier: Tier,
    /// Leaf count including the sentinel.
    pub size: u64,
    /// Map root at save time.
    #[serde(with = "hex_element")]
    pub root: Element,
    /// Output of [`MembershipMap::serialize`].
    pub json: String,
    /// Save time in milliseconds since the Unix epoch.
    pub updated_utc: u64,
}

impl StoredGroup {
    /// Snapshots `map` under `group_id`.
    pub fn capture(group_id: &str, map: &MembershipMap) -> Result<Self, StoreError> {
        Ok(Self {
            group_id: group_id.to_string(),
            tier: map.tier(),
            size: map.length(),
            root: map.root(),
            json: map.serialize()?,
            updated_utc: now_millis(),
        })
    }

    /// Restores the map and checks it against the recorded root.
    pub fn restore(&self) -> Result<MembershipMap, StoreError> {
        let map = MembershipMap::deserialize(&self.json, self.tier)?;
        if map.root() != self.root || map.length() != self.size {
            return Err(MapError::Corrupt(format!(
                "record for {} disagrees with its serialized state",
                self.group_id
            ))
            .into());
        }
        Ok(map)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Key-value persistence for group records; last write wins.
pub trait GroupStore {
    /// Fetches the record for `group_id`, if any.
    fn get(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError>;
    /// Writes `record`, replacing any previous one.
    fn put(&self, record: &StoredGroup) -> Result<(), StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, StoredGroup>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupStore for MemoryStore {
    fn get(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(group_id).cloned())
    }

    fn put(&self, record: &StoredGroup) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.group_id.clone(), record.clone());
        Ok(())
    }
}

/// Directory of `<hex group id>.group.json` records.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `dir` (created lazily on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, group_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.group.json", hex::encode(group_id.as_bytes())))
    }
}

impl GroupStore for FileStore {
    fn get(&self, group_id: &str) -> Result<Option<StoredGroup>, StoreError> {
        let path = self.path_for(group_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn put(&self, record: &StoredGroup) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.group_id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// Resolution flags for [`MembershipStore::get_or_create`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapOptions {
    /// Bypass the pool for both lookup and insertion.
    pub no_cache: bool,
    /// Ignore pool and storage; always start from an empty map.
    pub empty: bool,
    /// Tier for a newly created map; the store default when unset.
    pub tier: Option<Tier>,
}

impl MapOptions {
    /// Options requesting a fresh empty map.
    pub fn fresh() -> Self {
        Self {
            empty: true,
            ..Self::default()
        }
    }

    /// Sets the tier used if a new map is created.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }
}

impl FromStr for MapOptions {
    type Err = StoreError;

    /// Parses a comma separated flag list such as `"no_cache, medium"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = MapOptions::default();
        for flag in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "no_cache" => options.no_cache = true,
                "empty" => options.empty = true,
                other => {
                    options.tier = Some(
                        other
                            .parse()
                            .map_err(|_| StoreError::InvalidOption(other.to_string()))?,
                    )
                }
            }
        }
        Ok(options)
    }
}

/// Pool-fronted access to persisted group maps.
///
/// Callers serialise writers per group; the pool lock only protects the cache
/// itself.
#[derive(Debug)]
pub struct MembershipStore<S> {
    store: S,
    pool: Mutex<MapPool>,
    default_tier: Tier,
}

impl<S: GroupStore> MembershipStore<S> {
    /// Wraps `store` with `pool`; new maps default to [`Tier::Small`].
    pub fn new(store: S, pool: MapPool) -> Self {
        Self {
            store,
            pool: Mutex::new(pool),
            default_tier: Tier::default(),
        }
    }

    /// Overrides the tier used for new maps.
    pub fn with_default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    /// Underlying persistent store.
    pub fn backend(&self) -> &S {
        &self.store
    }

    /// Returns the map for `group_id`: pool, then storage, then a new empty map.
    pub fn get_or_create(
        &self,
        group_id: &str,
        options: MapOptions,
    ) -> Result<MembershipMap, StoreError> {
        let mut pool = self.pool.lock().map_err(|_| StoreError::Poisoned)?;
        if !options.empty {
            if !options.no_cache {
                if let Some(map) = pool.get(group_id) {
                    debug!(group = %group_id, "map pool hit");
                    return Ok(map.clone());
                }
            }
            if let Some(record) = self.store.get(group_id)? {
                let map = record.restore()?;
                debug!(group = %group_id, size = record.size, "map restored from store");
                if !options.no_cache {
                    pool.put(group_id, map.clone());
                }
                return Ok(map);
            }
        }
        let tier = options.tier.unwrap_or(self.default_tier);
        debug!(group = %group_id, %tier, "created empty map");
        let map = MembershipMap::new(tier);
        if !options.no_cache {
            pool.put(group_id, map.clone());
        }
        Ok(map)
    }

    /// Persists `map` under `group_id` and refreshes any cached copy.
    pub fn save(&self, group_id: &str, map: &MembershipMap) -> Result<StoredGroup, StoreError> {
        let record = StoredGroup::capture(group_id, map)?;
        self.store.put(&record)?;
        self.pool
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .refresh(group_id, map);
        info!(group = %group_id, size = record.size, tier = %record.tier, "map saved");
        Ok(record)
    }

    /// Evicts the cached instance only; returns whether one was resident.
    pub fn release(&self, group_id: &str) -> Result<bool, StoreError> {
        let released = self
            .pool
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .remove(group_id)
            .is_some();
        if released {
            debug!(group = %group_id, "map released from pool");
        }
        Ok(released)
    }

    /// True when `group_id` is resident in the pool.
    pub fn is_cached(&self, group_id: &str) -> bool {
        self.pool
            .lock()
            .map(|pool| pool.contains(group_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    fn e(n: u64) -> Element {
        Element::from(n)
    }

    fn store<S: GroupStore>(backend: S) -> MembershipStore<S> {
        MembershipStore::new(backend, MapPool::new(NonZeroUsize::new(8).unwrap()))
    }

    #[test]
    fn options_parse() {
        let options: MapOptions = "no_cache, empty, medium".parse().unwrap();
        assert!(options.no_cache && options.empty);
        assert_eq!(options.tier, Some(Tier::Medium));
        assert_eq!("".parse::<MapOptions>().unwrap(), MapOptions::default());
        assert!(matches!(
            "tiny".parse::<MapOptions>(),
            Err(StoreError::InvalidOption(_))
        ));
    }

    #[test]
    fn resolution_order() {
        let members = store(MemoryStore::new());
        let mut map = members
            .get_or_create("validators", MapOptions::default().with_tier(Tier::Medium))
            .unwrap();
        assert_eq!(map.tier(), Tier::Medium);
        map.insert(e(77), e(1)).unwrap();
        members.save("validators", &map).unwrap();

        // Pool copy was refreshed by save.
        let cached = members.get_or_create("validators", MapOptions::default()).unwrap();
        assert_eq!(cached.root(), map.root());

        // Eviction leaves storage intact.
        assert!(members.release("validators").unwrap());
        assert!(!members.release("validators").unwrap());
        let restored = members.get_or_create("validators", MapOptions::default()).unwrap();
        assert_eq!(restored, map);
        assert!(members.is_cached("validators"));

        let fresh = members.get_or_create("validators", MapOptions::fresh()).unwrap();
        assert!(fresh.is_empty());
        assert_eq!(fresh.tier(), Tier::Small);
    }

    #[test]
    fn no_cache_bypasses_pool() {
        let members = store(MemoryStore::new());
        let options = MapOptions {
            no_cache: true,
            ..MapOptions::default()
        };
        members.get_or_create("g", options).unwrap();
        assert!(!members.is_cached("g"));
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let members = store(FileStore::new(dir.path()));
        let mut map = members.get_or_create("claim/electors", MapOptions::default()).unwrap();
        map.insert(e(5), e(6)).unwrap();
        let record = members.save("claim/electors", &map).unwrap();
        assert_eq!(record.size, 2);

        let reopened = store(FileStore::new(dir.path()));
        let restored = reopened
            .get_or_create("claim/electors", MapOptions::default())
            .unwrap();
        assert_eq!(restored.root(), map.root());
        assert_eq!(restored.get(&e(5)).unwrap(), e(6));
    }

    #[test]
    fn tampered_record_is_rejected() {
        let backend = MemoryStore::new();
        let mut map = MembershipMap::new(Tier::Small);
        map.insert(e(1), e(1)).unwrap();
        let mut record = StoredGroup::capture("g", &map).unwrap();
        record.root = e(3);
        backend.put(&record).unwrap();
        let members = store(backend);
        assert!(matches!(
            members.get_or_create("g", MapOptions::default()),
            Err(StoreError::Map(MapError::Corrupt(_)))
        ));
    }
}
