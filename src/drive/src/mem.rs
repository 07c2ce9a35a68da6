use async_trait::async_trait;
use cloudstash_lib::{ContentHasher, Md5Hasher, StashError, StashResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

use crate::{Drive, RemoteMetadata, RemoteReader};

const MEM_CAPACITY: u64 = 1 << 40;

/// In-memory drive used by tests: a plain blob map with MD5 content hashes
/// and optional upload-failure injection.
pub struct MemDrive {
    files: Mutex<HashMap<String, Vec<u8>>>,
    locked: Mutex<bool>,
    fail_puts: AtomicBool,
}

impl MemDrive {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            locked: Mutex::new(false),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent `put` fail until reset, for retry tests.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn raw_blob(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    pub fn blob_names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Overwrites stored bytes directly, bypassing `put`; lets tests tamper
    /// with ciphertext at rest.
    pub fn store_raw(&self, name: &str, content: Vec<u8>) {
        self.files.lock().unwrap().insert(name.to_string(), content);
    }

    fn hash_of(content: &[u8]) -> String {
        let mut hasher = Box::new(Md5Hasher::new());
        hasher.update(content);
        hasher.finalize()
    }
}

impl Default for MemDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Drive for MemDrive {
    fn provider_name(&self) -> &'static str {
        "mem"
    }

    async fn get(&self, name: &str) -> StashResult<RemoteReader> {
        let content = self
            .raw_blob(name)
            .ok_or_else(|| StashError::NotFound(format!("no blob '{}'", name)))?;
        Ok(Box::pin(std::io::Cursor::new(content)))
    }

    async fn put(&self, name: &str, mut reader: RemoteReader) -> StashResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StashError::Remote("injected upload failure".to_string()));
        }
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        self.files.lock().unwrap().insert(name.to_string(), content);
        Ok(())
    }

    async fn metadata(&self, name: &str) -> StashResult<RemoteMetadata> {
        let content = self
            .raw_blob(name)
            .ok_or_else(|| StashError::NotFound(format!("no blob '{}'", name)))?;
        Ok(RemoteMetadata {
            name: name.to_string(),
            size: content.len() as u64,
            hash: Self::hash_of(&content),
        })
    }

    async fn delete(&self, name: &str) -> StashResult<()> {
        self.files
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StashError::NotFound(format!("no blob '{}'", name)))
    }

    async fn rename(&self, old: &str, new: &str) -> StashResult<()> {
        let mut files = self.files.lock().unwrap();
        let content = files
            .remove(old)
            .ok_or_else(|| StashError::NotFound(format!("no blob '{}'", old)))?;
        files.insert(new.to_string(), content);
        Ok(())
    }

    fn hasher(&self) -> Box<dyn ContentHasher + Send> {
        Box::new(Md5Hasher::new())
    }

    async fn lock(&self) -> StashResult<()> {
        let mut locked = self.locked.lock().unwrap();
        if *locked {
            return Err(StashError::Io("mem drive already locked".to_string()));
        }
        *locked = true;
        Ok(())
    }

    async fn unlock(&self) -> StashResult<()> {
        *self.locked.lock().unwrap() = false;
        Ok(())
    }

    async fn available_space(&self) -> StashResult<u64> {
        let used: usize = self.files.lock().unwrap().values().map(|v| v.len()).sum();
        Ok(MEM_CAPACITY.saturating_sub(used as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_drive_hash;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let drv = MemDrive::new();
        drv.put("a.dat", Box::pin(std::io::Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();

        let mut reader = drv.get("a.dat").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        let md = drv.metadata("a.dat").await.unwrap();
        assert_eq!(md.size, 5);
        let expected = compute_drive_hash(&drv, Box::pin(std::io::Cursor::new(b"hello".to_vec())))
            .await
            .unwrap();
        assert_eq!(md.hash, expected);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let drv = MemDrive::new();
        assert!(matches!(drv.get("nope").await, Err(e) if e.is_not_found()));
        assert!(drv.metadata("nope").await.unwrap_err().is_not_found());
        assert!(drv.delete("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename() {
        let drv = MemDrive::new();
        drv.put("old", Box::pin(std::io::Cursor::new(b"x".to_vec())))
            .await
            .unwrap();
        drv.rename("old", "new").await.unwrap();
        assert!(matches!(drv.get("old").await, Err(e) if e.is_not_found()));
        assert!(drv.get("new").await.is_ok());
    }
}
