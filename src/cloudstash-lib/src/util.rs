use md5::{Digest, Md5};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{StashError, StashResult};

const CACHE_FILE_PREFIX: &str = "cloudstash-cached-";
const DB_FILE_PREFIX: &str = "cloudstash-db-";

/// Parsed blob locator. A valid locator is `<scheme>://<name>` with no path
/// component, e.g. `dropbox://a31f.dat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUrl {
    pub scheme: String,
    pub name: String,
}

impl FileUrl {
    pub fn parse(url: &str) -> StashResult<Self> {
        let (scheme, name) = url
            .split_once("://")
            .ok_or_else(|| StashError::InvalidParam(format!("'{}' is not a file URL", url)))?;
        if scheme.is_empty() || name.is_empty() || name.contains('/') {
            return Err(StashError::InvalidParam(format!(
                "'{}' is not a valid file URL",
                url
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for FileUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.name)
    }
}

pub fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Opaque remote name for a new blob: MD5 over the visible name and the
/// current timestamp, plus a fixed extension.
pub fn obfuscate_file_name(name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    hasher.update(unix_nanos().to_string().as_bytes());
    format!("{}.dat", hex::encode(hasher.finalize()))
}

/// Name under which a superseded remote catalog is kept for recovery.
pub fn conflicted_copy_name(name: &str) -> String {
    format!("conflicted_copy_{}_{}", unix_nanos(), name)
}

fn new_temp_file(prefix: &str) -> StashResult<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()
        .map_err(|e| {
            warn!("couldn't create temp file: {}", e);
            StashError::Io(e.to_string())
        })?;
    let (_, path) = file
        .keep()
        .map_err(|e| StashError::Io(format!("couldn't persist temp file: {}", e)))?;
    Ok(path)
}

/// Creates an empty local file for decrypted cache content. The caller owns
/// the path and is responsible for deleting it.
pub fn new_cache_file() -> StashResult<PathBuf> {
    new_temp_file(CACHE_FILE_PREFIX)
}

/// Creates an empty local file for a catalog copy. The caller owns the path.
pub fn new_db_file() -> StashResult<PathBuf> {
    new_temp_file(DB_FILE_PREFIX)
}
