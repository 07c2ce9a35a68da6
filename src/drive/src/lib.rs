mod dropbox;
mod gdrive;
mod lock_backoff;
mod mem;

pub use dropbox::Dropbox;
pub use gdrive::{GDrive, OAuthToken};
pub use mem::MemDrive;

use async_trait::async_trait;
use cloudstash_lib::{compute_hash, ContentHasher, StashResult};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Streaming handle on a remote blob.
pub type RemoteReader = Pin<Box<dyn AsyncRead + Unpin + Send>>;

/// Lightweight head of a remote blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub name: String,
    pub size: u64,
    pub hash: String,
}

/// A remote blob-store backend. Providers are shared handles: multiple
/// operations dispatch through one instance concurrently and the provider
/// serializes internally where its protocol requires it.
#[async_trait]
pub trait Drive: Send + Sync {
    /// Stable short scheme used in blob locators, e.g. `dropbox`.
    fn provider_name(&self) -> &'static str;

    async fn get(&self, name: &str) -> StashResult<RemoteReader>;

    /// Replaces the blob. Providers whose upload semantics are
    /// non-overwriting must delete-then-upload.
    async fn put(&self, name: &str, reader: RemoteReader) -> StashResult<()>;

    async fn metadata(&self, name: &str) -> StashResult<RemoteMetadata>;

    /// Idempotent up to `NotFound`.
    async fn delete(&self, name: &str) -> StashResult<()>;

    /// Server-side rename, used for conflicted-copy creation.
    async fn rename(&self, old: &str, new: &str) -> StashResult<()>;

    /// Fresh hasher producing this provider's native content hash.
    fn hasher(&self) -> Box<dyn ContentHasher + Send>;

    /// Advisory mutual exclusion across clients over the remote lock object.
    async fn lock(&self) -> StashResult<()>;

    /// Releases the lock; loss of the lock file is tolerated.
    async fn unlock(&self) -> StashResult<()>;

    /// Free space in bytes, for drive selection.
    async fn available_space(&self) -> StashResult<u64>;
}

/// Locator stored in catalog rows for a blob on `drive`.
pub fn url_for(drive: &dyn Drive, name: &str) -> String {
    let name = name.strip_prefix('/').unwrap_or(name);
    format!("{}://{}", drive.provider_name(), name)
}

/// Provider-native content hash of a byte stream.
pub async fn compute_drive_hash(drive: &dyn Drive, reader: RemoteReader) -> StashResult<String> {
    compute_hash(reader, drive.hasher()).await
}
