use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sliding TTL of cached files.
pub const CACHE_EXPIRATION: Duration = Duration::from_secs(30 * 60);
/// How often the background sweep evicts idle entries.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Dirty files younger than this stay in the tracker so hot files batch up.
pub const TRACKER_IDLE_THRESHOLD: Duration = Duration::from_secs(10);

/// Download progress of a cached file. The placeholder makes the open path's
/// spin-wait precondition explicit: only `Available` carries a usable path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    Downloading,
    Available(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub state: FileState,
    /// MD5 of the plaintext content last observed for this inode.
    pub content_hash: String,
    deadline: Instant,
}

struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

/// Time-expiring map of inode → local decrypted file.
///
/// Eviction deletes the backing file, so entries must be removed through the
/// cache and never by unlinking paths directly.
#[derive(Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

impl FileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                ttl,
            }),
        }
    }

    /// Spawns the periodic eviction task for `cache`.
    pub fn spawn_sweeper(cache: FileCache, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let evicted = cache.sweep_expired();
                if evicted > 0 {
                    debug!("cache sweep evicted {} idle entries", evicted);
                }
            }
        })
    }

    /// Publishes a `Downloading` placeholder if the key is vacant. Returns
    /// false when another task already owns the download.
    pub fn claim_downloading(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.lock().unwrap();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                state: FileState::Downloading,
                content_hash: String::new(),
                deadline: Instant::now() + self.inner.ttl,
            },
        );
        true
    }

    pub fn insert_available(&self, key: &str, path: PathBuf, content_hash: String) {
        let mut entries = self.inner.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                state: FileState::Available(path),
                content_hash,
                deadline: Instant::now() + self.inner.ttl,
            },
        );
    }

    /// Promotes a placeholder published by `claim_downloading`.
    pub fn make_available(&self, key: &str, path: PathBuf, content_hash: String) {
        self.insert_available(key, path, content_hash);
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.entries.lock().unwrap().get(key).cloned()
    }

    /// Extends the entry's TTL atomically on access.
    pub fn touch(&self, key: &str) {
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.deadline = Instant::now() + self.inner.ttl;
        }
    }

    pub fn update_hash(&self, key: &str, content_hash: String) {
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.content_hash = content_hash;
        }
    }

    pub fn remove(&self, key: &str) {
        let removed = self.inner.entries.lock().unwrap().remove(key);
        if let Some(entry) = removed {
            Self::delete_backing_file(&entry);
        }
    }

    /// Removes every entry matching `pred`, deleting the backing files.
    /// Returns how many entries were evicted.
    pub fn flush_if<F>(&self, pred: F) -> usize
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let mut evicted = Vec::new();
        {
            let mut entries = self.inner.entries.lock().unwrap();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(k, v)| pred(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(entry) = entries.remove(&key) {
                    evicted.push(entry);
                }
            }
        }
        for entry in &evicted {
            Self::delete_backing_file(entry);
        }
        evicted.len()
    }

    pub fn flush_all(&self) {
        self.flush_if(|_, _| true);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts entries past their deadline. In-flight downloads are skipped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        self.flush_if(|_, entry| {
            matches!(entry.state, FileState::Available(_)) && entry.deadline <= now
        })
    }

    fn delete_backing_file(entry: &CacheEntry) {
        if let FileState::Available(path) = &entry.state {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("couldn't delete cached file {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub local_path: PathBuf,
    pub remote_url: String,
    pub access_time: Instant,
}

/// Insertion-ordered set of dirty local files awaiting upload. No TTL; the
/// push loop drains it.
pub struct Tracker {
    entries: Mutex<HashMap<String, TrackerEntry>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a dirty file, refreshing its access time.
    pub fn note(&self, local_path: &Path, remote_url: &str) {
        let key = local_path.to_string_lossy().to_string();
        self.entries.lock().unwrap().insert(
            key,
            TrackerEntry {
                local_path: local_path.to_path_buf(),
                remote_url: remote_url.to_string(),
                access_time: Instant::now(),
            },
        );
    }

    /// Removes and returns all entries.
    pub fn drain(&self) -> Vec<TrackerEntry> {
        self.entries.lock().unwrap().drain().map(|(_, v)| v).collect()
    }

    /// Removes and returns only the entries matching `pred`.
    pub fn drain_if<F>(&self, pred: F) -> Vec<TrackerEntry>
    where
        F: Fn(&TrackerEntry) -> bool,
    {
        let mut entries = self.entries.lock().unwrap();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| entries.remove(&k)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
