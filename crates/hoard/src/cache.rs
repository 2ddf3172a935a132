use crate::events::lock;
use packrat_core::{AssetIdentity, AssetKind, CacheError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const INDEX_FILE: &str = "cache_index.json";

/// Bytes left alone in path components. `%` is encoded, so the mapping is reversible.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// One cached file, as recorded in the index side-file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Milliseconds since the unix epoch, strictly increasing within a process.
    pub last_access: u64,
    #[serde(rename = "file_type")]
    pub kind: AssetKind,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    clock: u64,
}

impl CacheIndex {
    fn from_entries(entries: HashMap<String, CacheEntry>) -> Self {
        let total_bytes = entries.values().map(|e| e.size_bytes).sum();
        let clock = entries.values().map(|e| e.last_access).max().unwrap_or(0);
        Self {
            entries,
            total_bytes,
            clock,
        }
    }

    // Two accesses in the same millisecond still get distinct, ordered stamps.
    fn stamp(&mut self) -> u64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes -= old.size_bytes;
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }
}

/// Content-addressed on-disk store with a byte budget and LRU eviction.
///
/// The index lives behind a mutex because the initial load runs on a blocking
/// worker thread while resolution callbacks may already be querying it.
pub struct DiskCache {
    root: PathBuf,
    index_path: PathBuf,
    budget_bytes: u64,
    index: Mutex<CacheIndex>,
}

impl DiskCache {
    /// Opens (or creates) the cache under `root`, dropping index entries whose file
    /// has disappeared.
    pub fn open(root: impl Into<PathBuf>, budget_bytes: u64) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, e))?;
        let index_path = root.join(INDEX_FILE);

        let mut entries = read_index(&index_path);
        let before = entries.len();
        entries.retain(|key, entry| {
            let present = entry.path.is_file();
            if !present {
                log::debug!("Dropping stale cache entry {} ({:?})", key, entry.path);
            }
            present
        });
        let dropped = before - entries.len();

        let cache = Self {
            root,
            index_path,
            budget_bytes,
            index: Mutex::new(CacheIndex::from_entries(entries)),
        };
        if dropped > 0 {
            log::info!("Repaired cache index: {} stale entries removed", dropped);
            cache.persist(&lock(&cache.index));
        }
        Ok(cache)
    }

    /// [`DiskCache::open`] on a blocking worker, keeping the JSON decode off the
    /// cooperative thread.
    pub async fn open_async(root: PathBuf, budget_bytes: u64) -> Result<Self, CacheError> {
        async_std::task::spawn_blocking(move || Self::open(root, budget_bytes)).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of an identity's file:
    /// `<root>/<pack>/<kind>s/<asset>/<variant>.<ext>`.
    ///
    /// Components are percent-encoded, so distinct identities never share a file.
    pub fn path_for(&self, identity: &AssetIdentity) -> PathBuf {
        self.root
            .join(sanitize(&identity.pack_id))
            .join(identity.kind.subdir())
            .join(sanitize(&identity.asset_id))
            .join(format!(
                "{}.{}",
                sanitize(&identity.variant_id),
                identity.kind.default_extension()
            ))
    }

    /// Cached path for `identity`, touching its access time.
    ///
    /// An entry whose file was deleted behind our back is dropped and reported as a miss.
    pub fn get(&self, identity: &AssetIdentity) -> Option<PathBuf> {
        let key = identity.key();
        let mut index = lock(&self.index);
        let path = index.entries.get(&key)?.path.clone();

        if !path.is_file() {
            log::debug!("Cached file for {} vanished, dropping entry", key);
            index.remove(&key);
            self.persist(&index);
            return None;
        }

        let stamp = index.stamp();
        if let Some(entry) = index.entries.get_mut(&key) {
            entry.last_access = stamp;
        }
        Some(path)
    }

    /// Index-only membership check. Does not touch the file or the access time.
    pub fn contains(&self, identity: &AssetIdentity) -> bool {
        lock(&self.index).entries.contains_key(&identity.key())
    }

    /// Writes `bytes` as the cached file for `identity`. Least recently used entries
    /// are evicted to make room only once the write has landed.
    pub fn store(&self, identity: &AssetIdentity, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let key = identity.key();
        let path = self.path_for(identity);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let size = bytes.len() as u64;
        let mut index = lock(&self.index);
        let victims = self.eviction_set(&index, &key, size);

        // A failed write leaves the index and every other file as they were.
        write_atomic(&path, bytes)?;

        index.remove(&key);
        self.evict(&mut index, victims);
        let last_access = index.stamp();
        index.insert(
            key,
            CacheEntry {
                path: path.clone(),
                size_bytes: size,
                last_access,
                kind: identity.kind,
            },
        );
        self.persist(&index);
        Ok(path)
    }

    /// Indexes a file some other writer already put in place (streamed downloads).
    pub fn register_existing(
        &self,
        identity: &AssetIdentity,
        path: &Path,
    ) -> Result<(), CacheError> {
        let size = fs::metadata(path)
            .map_err(|e| CacheError::io(path, e))?
            .len();
        let key = identity.key();

        let mut index = lock(&self.index);
        let victims = self.eviction_set(&index, &key, size);
        index.remove(&key);
        self.evict(&mut index, victims);

        let last_access = index.stamp();
        index.insert(
            key,
            CacheEntry {
                path: path.to_path_buf(),
                size_bytes: size,
                last_access,
                kind: identity.kind,
            },
        );
        self.persist(&index);
        Ok(())
    }

    /// Deletes the cached file and its entry. Returns whether an entry existed.
    pub fn remove(&self, identity: &AssetIdentity) -> bool {
        let mut index = lock(&self.index);
        let Some(entry) = index.remove(&identity.key()) else {
            return false;
        };
        delete_file(&entry.path);
        self.persist(&index);
        true
    }

    /// Deletes every cached file, the emptied directories, and resets the index.
    pub fn clear_all(&self) -> Result<(), CacheError> {
        let mut index = lock(&self.index);
        for entry in index.entries.values() {
            delete_file(&entry.path);
        }
        index.entries.clear();
        index.total_bytes = 0;
        prune_empty_dirs(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        self.persist(&index);
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        lock(&self.index).total_bytes
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 1.0;
        }
        self.size_bytes() as f64 / self.budget_bytes as f64
    }

    pub fn len(&self) -> usize {
        lock(&self.index).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the index, oldest access first.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        let index = lock(&self.index);
        let mut entries: Vec<_> = index
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        entries.sort_by_key(|(_, e)| e.last_access);
        entries
    }

    // Oldest-accessed first until `incoming` fits, not counting the entry `key`
    // replaces. A payload larger than the whole budget empties the cache and is
    // still written.
    fn eviction_set(&self, index: &CacheIndex, key: &str, incoming: u64) -> Vec<String> {
        let replaced = index.entries.get(key).map_or(0, |e| e.size_bytes);
        let mut total = index.total_bytes - replaced;
        if total + incoming <= self.budget_bytes {
            return Vec::new();
        }
        let target = self.budget_bytes.saturating_sub(incoming);

        let mut by_age: Vec<(&String, &CacheEntry)> =
            index.entries.iter().filter(|(k, _)| *k != key).collect();
        by_age.sort_by_key(|(_, e)| e.last_access);

        let mut victims = Vec::new();
        for (victim, entry) in by_age {
            if total <= target {
                break;
            }
            total -= entry.size_bytes;
            victims.push(victim.clone());
        }
        victims
    }

    fn evict(&self, index: &mut CacheIndex, victims: Vec<String>) {
        for key in victims {
            if let Some(entry) = index.remove(&key) {
                log::info!("Evicting {} ({} bytes)", key, entry.size_bytes);
                delete_file(&entry.path);
            }
        }
    }

    fn persist(&self, index: &CacheIndex) {
        let result = serde_json::to_vec_pretty(&index.entries)
            .map_err(CacheError::from)
            .and_then(|json| write_atomic(&self.index_path, &json));
        if let Err(e) = result {
            log::warn!("Failed to persist cache index: {}", e);
        }
    }
}

fn read_index(path: &Path) -> HashMap<String, CacheEntry> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            log::warn!("Could not read cache index {:?}: {}", path, e);
            return HashMap::new();
        }
    };
    serde_json::from_slice(&content).unwrap_or_else(|e| {
        log::warn!("Cache index {:?} is corrupt, starting empty: {}", path, e);
        HashMap::new()
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| CacheError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CacheError::io(path, e)
    })
}

fn delete_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete cached file {:?}: {}", path, e),
    }
}

/// Removes empty directories below `root`, leaving `root` itself.
fn prune_empty_dirs(root: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            prune_empty_dirs(&path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}

fn sanitize(component: &str) -> String {
    match component {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => utf8_percent_encode(component, PATH_SAFE).to_string(),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
