mod cipher;
mod hash;
mod util;

pub use cipher::{derive_key, Cipher, DecryptReader, EncryptReader, CIPHER_CHUNK_SIZE};
pub use hash::{
    compute_hash, md5_checksum, ContentHasher, DropboxHasher, HashSink, HashTeeReader, Md5Hasher,
};
pub use util::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum StashError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("forbidden name: {0}")]
    Forbidden(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("catalog unrecoverable: {0}")]
    DbCorrupt(String),
    #[error("authorization failed: {0}")]
    AuthFailed(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
}

impl StashError {
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 => StashError::NotFound(info),
            401 | 403 => StashError::AuthFailed(info),
            _ => StashError::Remote(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StashError::NotFound(_))
    }
}

pub type StashResult<T> = std::result::Result<T, StashError>;

impl From<std::io::Error> for StashError {
    fn from(err: std::io::Error) -> Self {
        StashError::Io(err.to_string())
    }
}

/// Remote name of the encrypted catalog blob.
pub const CATALOG_FILE_NAME: &str = "cloudstash.sqlite3";
/// Remote name of the distributed lock object.
pub const LOCK_FILE_NAME: &str = "lock.file";
