use catalog::Catalog;
use cloudstash_lib::{conflicted_copy_name, FileUrl, HashTeeReader, StashError, StashResult, CATALOG_FILE_NAME};
use drive::Drive;
use futures_util::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{TrackerEntry, TRACKER_IDLE_THRESHOLD};
use crate::database::{merge_catalogs, Database};
use crate::manager::Manager;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How often the pull loop polls the remote catalog hash.
    pub pull_interval: Duration,
    /// How often the push loop drains the tracker.
    pub push_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(10),
            push_interval: Duration::from_secs(2),
        }
    }
}

/// The two background reconciliation loops. Both observe a shutdown signal
/// between ticks; a tick's work is idempotent, so a shutdown mid-tick is
/// tolerated.
pub struct SyncServer {
    shutdown_tx: watch::Sender<bool>,
    pull_handle: JoinHandle<()>,
    push_handle: JoinHandle<()>,
}

impl SyncServer {
    pub fn spawn(manager: Arc<Manager>, options: SyncOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pull_manager = manager.clone();
        let mut pull_rx = shutdown_rx.clone();
        let pull_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.pull_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pull_manager.pull_tick().await,
                    _ = pull_rx.changed() => break,
                }
            }
        });

        let push_manager = manager;
        let mut push_rx = shutdown_rx;
        let push_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.push_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => push_manager.push_tick(false).await,
                    _ = push_rx.changed() => break,
                }
            }
        });

        Self {
            shutdown_tx,
            pull_handle,
            push_handle,
        }
    }

    /// Signals both loops and waits for them to park.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.pull_handle.await;
        let _ = self.push_handle.await;
    }
}

impl Manager {
    /// One pull round: if the remote catalog hash moved, re-download the
    /// catalog under the writer lock and then drop every cache entry whose
    /// backing row disappeared or changed upstream.
    pub async fn pull_tick(&self) {
        let drv = self.db.drive().clone();
        let remote = match drv.metadata(CATALOG_FILE_NAME).await {
            Ok(md) => md,
            Err(e) => {
                warn!("couldn't get metadata of remote catalog: {}", e);
                return;
            }
        };

        {
            let mut st = self.db.write().await;
            if remote.hash == st.remote_hash {
                return;
            }
            info!("remote catalog changed, refreshing local copy");

            let (path, hash) = match Database::download(&drv, &self.cipher).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("couldn't fetch updated catalog: {}", e);
                    return;
                }
            };
            if let Err(e) = tokio::fs::remove_file(&st.local_path).await {
                warn!("couldn't remove stale catalog copy: {}", e);
            }
            st.local_path = path;
            st.remote_hash = hash;
        }

        // lock downgraded to reader for the invalidation scan
        let st = self.db.read().await;
        let cat = match Catalog::open(&st.local_path) {
            Ok(cat) => cat,
            Err(e) => {
                warn!("couldn't open refreshed catalog, dropping cache: {}", e);
                self.cache.flush_all();
                return;
            }
        };
        self.cache.flush_if(|key, entry| match key.parse::<i64>() {
            Err(_) => true,
            Ok(inode) => match cat.get(inode) {
                Err(_) => true,
                Ok(md) => md.hash != entry.content_hash,
            },
        });
    }

    /// One push round: drains settled tracker entries and uploads them, all
    /// uploads completing before the round returns so consecutive ticks
    /// cannot overlap.
    pub async fn push_tick(&self, force: bool) {
        let entries = if force {
            self.tracker.drain()
        } else {
            self.tracker
                .drain_if(|e| e.access_time.elapsed() > TRACKER_IDLE_THRESHOLD)
        };
        if entries.is_empty() {
            return;
        }

        join_all(entries.into_iter().map(|entry| self.push_entry(entry))).await;
    }

    /// Force-drains everything still pending. Used once at shutdown.
    pub async fn push_all_now(&self) {
        self.push_tick(true).await;
    }

    async fn push_entry(&self, entry: TrackerEntry) {
        let is_catalog = { entry.local_path == self.db.read().await.local_path };

        if is_catalog {
            if let Err(e) = self.push_catalog().await {
                warn!("couldn't push catalog: {}", e);
                // a bricked catalog is left for the pull loop to replace
                if !matches!(e, StashError::DbCorrupt(_)) {
                    self.notify_change_in_database().await;
                }
            }
        } else if let Err(e) = self.push_file(&entry).await {
            warn!("couldn't upload '{}': {}", entry.remote_url, e);
            self.tracker.note(&entry.local_path, &entry.remote_url);
        }
    }

    async fn push_file(&self, entry: &TrackerEntry) -> StashResult<()> {
        let url = FileUrl::parse(&entry.remote_url)?;
        let drv = self.drive_for(&url.scheme)?;

        let file = tokio::fs::File::open(&entry.local_path).await?;
        let encrypted = self.cipher.encrypt_reader(file);
        let (tee, _sink) = HashTeeReader::new(encrypted, drv.hasher());
        drv.put(&url.name, Box::pin(tee)).await
    }

    async fn push_catalog(&self) -> StashResult<()> {
        let drv = self.db.drive().clone();
        drv.lock().await?;
        let result = self.push_catalog_locked(&drv).await;
        if let Err(e) = drv.unlock().await {
            warn!("couldn't release catalog lock: {}", e);
        }
        result
    }

    async fn push_catalog_locked(&self, drv: &Arc<dyn Drive>) -> StashResult<()> {
        let mut st = self.db.write().await;

        let remote_hash = match drv.metadata(CATALOG_FILE_NAME).await {
            Ok(md) => md.hash,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e),
        };

        if !remote_hash.is_empty() && remote_hash != st.remote_hash {
            info!("remote catalog diverged, merging before upload");

            let (remote_path, _) = Database::download(drv, &self.cipher).await?;
            let merged = merge_catalogs(&st.local_path, &remote_path, &self.cache).await;
            let _ = tokio::fs::remove_file(&remote_path).await;
            merged?;

            // keep the superseded remote catalog for out-of-band recovery
            if let Err(e) = drv
                .rename(CATALOG_FILE_NAME, &conflicted_copy_name(CATALOG_FILE_NAME))
                .await
            {
                warn!("unable to rename remote catalog: {}", e);
            }
        }

        let hash = Database::upload(drv, &self.cipher, &st.local_path).await?;
        st.remote_hash = hash;
        Ok(())
    }
}
