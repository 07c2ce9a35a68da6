use catalog::{Catalog, Inode};
use cloudstash_lib::{new_db_file, Cipher, HashTeeReader, StashError, StashResult, CATALOG_FILE_NAME};
use drive::Drive;
use log::{error, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;

use crate::cache::FileCache;

const MERGE_CHUNK_ROWS: usize = 1000;
const MERGE_TASK_LIMIT: usize = 32;

#[derive(Debug)]
pub struct DbState {
    /// Decrypted catalog file on local disk. Swapped by the pull loop.
    pub local_path: PathBuf,
    /// Provider content hash of the encrypted catalog blob last synchronized.
    pub remote_hash: String,
}

/// The catalog envelope: local copy, last-known remote hash, and the
/// reader/writer lock serializing every catalog access in the process.
pub struct Database {
    drive: Arc<dyn Drive>,
    state: RwLock<DbState>,
}

impl Database {
    /// Initializes a brand-new catalog locally and uploads it.
    pub async fn create(drive: Arc<dyn Drive>, cipher: &Cipher) -> StashResult<Self> {
        let local_path = new_db_file()?;
        if let Err(e) = Catalog::init(&local_path) {
            let _ = tokio::fs::remove_file(&local_path).await;
            return Err(e);
        }

        let remote_hash = match Self::upload(&drive, cipher, &local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                let _ = tokio::fs::remove_file(&local_path).await;
                return Err(e);
            }
        };

        Ok(Self {
            drive,
            state: RwLock::new(DbState {
                local_path,
                remote_hash,
            }),
        })
    }

    /// Downloads and validates the remote catalog.
    pub async fn fetch(drive: Arc<dyn Drive>, cipher: &Cipher) -> StashResult<Self> {
        let (local_path, remote_hash) = Self::download(&drive, cipher).await?;
        Ok(Self {
            drive,
            state: RwLock::new(DbState {
                local_path,
                remote_hash,
            }),
        })
    }

    pub fn drive(&self) -> &Arc<dyn Drive> {
        &self.drive
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, DbState> {
        self.state.write().await
    }

    /// Removes the local catalog file. Called once on shutdown.
    pub async fn clean(&self) {
        let st = self.state.read().await;
        if let Err(e) = tokio::fs::remove_file(&st.local_path).await {
            warn!(
                "couldn't remove catalog file {}: {}",
                st.local_path.display(),
                e
            );
        }
    }

    /// Encrypts and uploads the local catalog, returning the provider hash
    /// of the ciphertext as streamed to the drive.
    pub(crate) async fn upload(
        drive: &Arc<dyn Drive>,
        cipher: &Cipher,
        local_path: &Path,
    ) -> StashResult<String> {
        let file = tokio::fs::File::open(local_path).await?;
        let encrypted = cipher.encrypt_reader(file);
        let (tee, sink) = HashTeeReader::new(encrypted, drive.hasher());

        drive.put(CATALOG_FILE_NAME, Box::pin(tee)).await?;
        sink.take()
            .ok_or_else(|| StashError::Io("catalog upload hash was not computed".to_string()))
    }

    /// Fetches and decrypts the remote catalog into a fresh temp file and
    /// verifies its schema. Returns the path and the streamed ciphertext hash.
    pub(crate) async fn download(
        drive: &Arc<dyn Drive>,
        cipher: &Cipher,
    ) -> StashResult<(PathBuf, String)> {
        let reader = drive.get(CATALOG_FILE_NAME).await?;
        // the tee must see the ciphertext, its digest is compared against
        // what the provider reports for the stored blob
        let (tee, sink) = HashTeeReader::new(reader, drive.hasher());
        let mut decrypted = cipher.decrypt_reader(tee);

        let local_path = new_db_file()?;
        let mut file = tokio::fs::File::create(&local_path).await?;
        if let Err(e) = tokio::io::copy(&mut decrypted, &mut file).await {
            let _ = tokio::fs::remove_file(&local_path).await;
            return Err(StashError::Io(format!(
                "couldn't copy catalog to local file: {}",
                e
            )));
        }
        file.flush().await?;
        drop(file);

        let hash = sink
            .take()
            .ok_or_else(|| StashError::Io("catalog download hash was not computed".to_string()))?;

        let valid = Catalog::open(&local_path).map(|c| c.is_valid()).unwrap_or(false);
        if !valid {
            let _ = tokio::fs::remove_file(&local_path).await;
            return Err(StashError::Db(
                "couldn't verify the downloaded catalog".to_string(),
            ));
        }

        Ok((local_path, hash))
    }
}

/// Client-side catalog merge with a last-writer-biased rule set:
/// rows only the remote knows are adopted verbatim, rows that differ in all
/// of name, parent and hash are treated as identity collisions (remote wins
/// the inode, the local row is re-inserted under a fresh one), anything else
/// keeps the local row so in-flight local changes take priority.
pub(crate) async fn merge_catalogs(
    local_path: &Path,
    remote_path: &Path,
    cache: &FileCache,
) -> StashResult<()> {
    let backup = backup_database(local_path).await?;

    match merge_inner(local_path, remote_path, cache).await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&backup).await;
            Ok(())
        }
        Err(e) => {
            warn!("merge failed, restoring catalog from backup: {}", e);
            if let Err(restore_err) = tokio::fs::copy(&backup, local_path).await {
                error!(
                    "critical error, catalog may be bricked: {}",
                    restore_err
                );
                let _ = tokio::fs::remove_file(&backup).await;
                return Err(StashError::DbCorrupt(restore_err.to_string()));
            }
            let _ = tokio::fs::remove_file(&backup).await;
            Err(e)
        }
    }
}

async fn merge_inner(
    local_path: &Path,
    remote_path: &Path,
    cache: &FileCache,
) -> StashResult<()> {
    let local = Arc::new(RwLock::new(Catalog::open(local_path)?));
    let remote = Catalog::open(remote_path)?;
    let row_count = remote.count_rows()?;

    let mut offset = 0usize;
    let mut tasks: Vec<JoinHandle<StashResult<()>>> = Vec::new();

    while offset < row_count {
        let rows = remote.get_rows(MERGE_CHUNK_ROWS, offset)?;
        if rows.is_empty() {
            break;
        }
        offset += rows.len();

        let local = local.clone();
        let cache = cache.clone();
        tasks.push(tokio::spawn(process_chunk(rows, local, cache)));

        if tasks.len() == MERGE_TASK_LIMIT {
            join_merge_tasks(&mut tasks).await?;
        }
    }

    join_merge_tasks(&mut tasks).await
}

async fn join_merge_tasks(tasks: &mut Vec<JoinHandle<StashResult<()>>>) -> StashResult<()> {
    let mut first_err = None;
    for task in tasks.drain(..) {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_err = first_err.or(Some(e)),
            Err(e) => {
                first_err = first_err.or(Some(StashError::Io(format!("merge task died: {}", e))))
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn process_chunk(
    rows: Vec<Inode>,
    local: Arc<RwLock<Catalog>>,
    cache: FileCache,
) -> StashResult<()> {
    for md in rows {
        let existing = { local.read().await.get(md.inode) };
        let lmd = match existing {
            Ok(lmd) => lmd,
            Err(e) if e.is_not_found() => {
                // new on the remote side, adopt with its inode number so all
                // clients converge on the same numbering
                local.write().await.force_insert(&md)?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if lmd.name != md.name && lmd.parent != md.parent && lmd.hash != md.hash {
            // a completely different file claims this inode: the remote entry
            // becomes the authoritative identity, the local row moves to a
            // fresh inode, and any cache under the old number must go
            let guard = local.write().await;
            guard.update(&md)?;
            guard.insert(&lmd)?;
            drop(guard);

            cache.remove(&md.inode.to_string());
        }
    }
    Ok(())
}

async fn backup_database(local_path: &Path) -> StashResult<PathBuf> {
    let backup = new_db_file()?;
    if let Err(e) = tokio::fs::copy(local_path, &backup).await {
        let _ = tokio::fs::remove_file(&backup).await;
        return Err(StashError::Io(format!(
            "couldn't back up current catalog: {}",
            e
        )));
    }
    Ok(backup)
}
