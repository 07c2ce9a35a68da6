use catalog::{Catalog, Inode};
use cloudstash_lib::{
    md5_checksum, new_cache_file, obfuscate_file_name, Cipher, ContentHasher, FileUrl, Md5Hasher,
    StashError, StashResult, CATALOG_FILE_NAME,
};
use drive::{url_for, Drive};
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{FileCache, FileState, Tracker, CACHE_EXPIRATION, CACHE_SWEEP_INTERVAL};
use crate::database::Database;

const DOWNLOAD_SPIN_WAIT: Duration = Duration::from_micros(10);

/// Owns the catalog envelope, the local file cache, the dirty-file tracker
/// and the provider handles. Every filesystem operation routes through here;
/// all operations are safe for concurrent invocation.
pub struct Manager {
    pub(crate) drives: Vec<Arc<dyn Drive>>,
    pub(crate) cipher: Cipher,
    pub(crate) db: Database,
    pub(crate) cache: FileCache,
    pub(crate) tracker: Tracker,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(drives: Vec<Arc<dyn Drive>>, db: Database, cipher: Cipher) -> Arc<Self> {
        let cache = FileCache::new(CACHE_EXPIRATION);
        let sweeper = FileCache::spawn_sweeper(cache.clone(), CACHE_SWEEP_INTERVAL);
        Arc::new(Self {
            drives,
            cipher,
            db,
            cache,
            tracker: Tracker::new(),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Finds the entry called `name` under `parent`.
    pub async fn lookup(&self, parent: i64, name: &str) -> StashResult<Inode> {
        let st = self.db.read().await;
        Catalog::open(&st.local_path)?.search(parent, name)
    }

    pub async fn metadata(&self, inode: i64) -> StashResult<Inode> {
        let st = self.db.read().await;
        Catalog::open(&st.local_path)?.get(inode)
    }

    pub async fn list_directory(&self, inode: i64) -> StashResult<Vec<Inode>> {
        let st = self.db.read().await;
        let cat = Catalog::open(&st.local_path)?;
        let md = cat.get(inode)?;
        if !md.kind.is_dir() {
            return Err(StashError::NotDir(format!("inode {} is a file", inode)));
        }
        cat.list_children(inode)
    }

    pub async fn add_directory(&self, parent: i64, name: &str, mode: u16) -> StashResult<Inode> {
        validate_name(name)?;
        let md = {
            let st = self.db.write().await;
            Catalog::open(&st.local_path)?.add_directory(parent, name, mode)?
        };
        self.notify_change_in_database().await;
        Ok(md)
    }

    /// Creates an empty regular file: picks the roomiest drive, allocates an
    /// opaque remote name, and seeds a zero-byte cache entry. The blob itself
    /// is uploaded by the push loop after the first write lands.
    pub async fn create_file(&self, parent: i64, name: &str, mode: u16) -> StashResult<Inode> {
        validate_name(name)?;

        let drv = self.choose_drive().await?;
        let url = url_for(drv.as_ref(), &obfuscate_file_name(name));
        let empty_hash = empty_md5();

        let cache_path = new_cache_file()?;
        let md = {
            let st = self.db.write().await;
            let cat = Catalog::open(&st.local_path)?;
            match cat.create_file(parent, name, mode, &url, &empty_hash) {
                Ok(md) => md,
                Err(e) => {
                    let _ = std::fs::remove_file(&cache_path);
                    return Err(e);
                }
            }
        };

        self.cache
            .insert_available(&md.inode.to_string(), cache_path, empty_hash);
        self.notify_change_in_database().await;
        Ok(md)
    }

    /// Deletes the catalog row and cached copy; the remote blob is deleted
    /// in the background. Repeating the call is a no-op.
    pub async fn remove_file(&self, inode: i64) -> StashResult<()> {
        let md = {
            let st = self.db.write().await;
            let cat = Catalog::open(&st.local_path)?;
            let md = match cat.get(inode) {
                Ok(md) => md,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            cat.delete(inode)?;
            md
        };

        self.cache.remove(&inode.to_string());
        self.spawn_remote_delete(&md);
        self.notify_change_in_database().await;
        Ok(())
    }

    pub async fn remove_directory(&self, inode: i64) -> StashResult<()> {
        {
            let st = self.db.write().await;
            let cat = Catalog::open(&st.local_path)?;
            let md = cat.get(inode)?;
            if !md.kind.is_dir() {
                return Err(StashError::NotDir(format!("inode {} is a file", inode)));
            }
            if !cat.list_children(inode)?.is_empty() {
                return Err(StashError::DirNotEmpty(format!(
                    "directory {} has children",
                    inode
                )));
            }
            cat.delete(inode)?;
        }
        self.notify_change_in_database().await;
        Ok(())
    }

    /// Rename, chmod and re-parent are all one full-row update.
    pub async fn update_metadata(&self, md: &Inode) -> StashResult<()> {
        {
            let st = self.db.write().await;
            Catalog::open(&st.local_path)?.update(md)?;
        }
        self.notify_change_in_database().await;
        Ok(())
    }

    /// Called on flush: reconciles the cached file's size and checksum into
    /// the catalog and queues the upload when content actually changed.
    pub async fn update_metadata_from_cache(&self, inode: i64) -> StashResult<()> {
        let key = inode.to_string();
        let entry = match self.cache.get(&key) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let path = match entry.state {
            FileState::Available(path) => path,
            FileState::Downloading => return Ok(()),
        };

        let file = tokio::fs::File::open(&path).await?;
        let sum = md5_checksum(file).await?;
        let size = tokio::fs::metadata(&path).await?.len();

        let changed_url = {
            let st = self.db.write().await;
            let cat = Catalog::open(&st.local_path)?;
            let mut md = cat.get(inode)?;
            if md.hash == sum {
                None
            } else {
                md.size = size;
                md.hash = sum.clone();
                cat.update(&md)?;
                Some(md.url)
            }
        };

        if let Some(url) = changed_url {
            self.cache.update_hash(&key, sum);
            self.notify_change_in_file(&path, &url);
            self.notify_change_in_database().await;
        }
        Ok(())
    }

    /// Cache-through open: downloads and decrypts the blob on first use,
    /// then hands out the local file. Concurrent openers wait on the
    /// `Downloading` placeholder.
    pub async fn open_file(&self, inode: i64, write: bool) -> StashResult<tokio::fs::File> {
        let md = self.metadata(inode).await?;
        if md.kind.is_dir() {
            return Err(StashError::IsDir(format!("inode {} is a directory", inode)));
        }

        let key = inode.to_string();
        loop {
            match self.cache.get(&key) {
                Some(entry) => match entry.state {
                    FileState::Available(path) => {
                        self.cache.touch(&key);
                        return self.open_cached(&path, write).await;
                    }
                    FileState::Downloading => {
                        tokio::time::sleep(DOWNLOAD_SPIN_WAIT).await;
                    }
                },
                None => {
                    if self.cache.claim_downloading(&key) {
                        break;
                    }
                }
            }
        }

        match self.download_into_cache(&md).await {
            Ok(path) => self.open_cached(&path, write).await,
            Err(e) => {
                self.cache.remove(&key);
                Err(e)
            }
        }
    }

    /// Marks a local file dirty so the push loop uploads it.
    pub fn notify_change_in_file(&self, local_path: &std::path::Path, remote_url: &str) {
        self.tracker.note(local_path, remote_url);
    }

    /// Marks the catalog itself dirty.
    pub async fn notify_change_in_database(&self) {
        let st = self.db.read().await;
        let url = url_for(self.db.drive().as_ref(), CATALOG_FILE_NAME);
        self.tracker.note(&st.local_path, &url);
    }

    pub(crate) fn drive_for(&self, scheme: &str) -> StashResult<Arc<dyn Drive>> {
        self.drives
            .iter()
            .find(|d| d.provider_name() == scheme)
            .cloned()
            .ok_or_else(|| StashError::InvalidParam(format!("no drive client for '{}'", scheme)))
    }

    /// Force-pushes pending changes, drops every cached file and removes the
    /// local catalog copy.
    pub async fn shutdown(&self) {
        self.push_all_now().await;
        self.cache.flush_all();
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.db.clean().await;
    }

    async fn open_cached(&self, path: &PathBuf, write: bool) -> StashResult<tokio::fs::File> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .await?;
        Ok(file)
    }

    async fn download_into_cache(&self, md: &Inode) -> StashResult<PathBuf> {
        let url = FileUrl::parse(&md.url)?;
        let drv = self.drive_for(&url.scheme)?;

        debug!("caching inode {} from {}", md.inode, md.url);
        let reader = drv.get(&url.name).await?;
        let mut decrypted = self.cipher.decrypt_reader(reader);

        let path = new_cache_file()?;
        let mut file = tokio::fs::File::create(&path).await?;
        if let Err(e) = tokio::io::copy(&mut decrypted, &mut file).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StashError::Io(format!(
                "couldn't download inode {}: {}",
                md.inode, e
            )));
        }

        self.cache
            .make_available(&md.inode.to_string(), path.clone(), md.hash.clone());
        Ok(path)
    }

    /// Picks the configured drive with the most free space.
    async fn choose_drive(&self) -> StashResult<Arc<dyn Drive>> {
        let mut best: Option<(u64, Arc<dyn Drive>)> = None;
        for drv in &self.drives {
            match drv.available_space().await {
                Ok(space) => {
                    if best.as_ref().map(|(s, _)| space > *s).unwrap_or(true) {
                        best = Some((space, drv.clone()));
                    }
                }
                Err(e) => warn!(
                    "couldn't get available space of {}: {}",
                    drv.provider_name(),
                    e
                ),
            }
        }
        best.map(|(_, d)| d)
            .ok_or_else(|| StashError::Io("no drive has available space".to_string()))
    }

    fn spawn_remote_delete(&self, md: &Inode) {
        if md.url.is_empty() {
            return;
        }
        let url = match FileUrl::parse(&md.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("couldn't parse url '{}', skipping delete: {}", md.url, e);
                return;
            }
        };
        let drv = match self.drive_for(&url.scheme) {
            Ok(drv) => drv,
            Err(e) => {
                warn!("couldn't find drive client of '{}': {}", url.scheme, e);
                return;
            }
        };
        tokio::spawn(async move {
            match drv.delete(&url.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("couldn't delete remote blob '{}': {}", url.name, e),
            }
        });
    }
}

fn validate_name(name: &str) -> StashResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StashError::Forbidden(format!("invalid name '{}'", name)));
    }
    Ok(())
}

fn empty_md5() -> String {
    let hasher: Box<dyn ContentHasher + Send> = Box::new(Md5Hasher::new());
    hasher.finalize()
}
