use md5::{Digest, Md5};
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::StashResult;

/// Incremental content hash in a provider's native format.
pub trait ContentHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> String;
}

const DROPBOX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Dropbox content hash: SHA-256 per 4 MiB block, then SHA-256 over the
/// concatenated block digests.
/// See https://www.dropbox.com/developers/reference/content-hash
pub struct DropboxHasher {
    block: Sha256,
    block_filled: usize,
    digests: Vec<u8>,
}

impl DropboxHasher {
    pub fn new() -> Self {
        Self {
            block: Sha256::new(),
            block_filled: 0,
            digests: Vec::new(),
        }
    }
}

impl Default for DropboxHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for DropboxHasher {
    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = DROPBOX_BLOCK_SIZE - self.block_filled;
            let take = room.min(data.len());
            self.block.update(&data[..take]);
            self.block_filled += take;
            data = &data[take..];

            if self.block_filled == DROPBOX_BLOCK_SIZE {
                let digest = std::mem::replace(&mut self.block, Sha256::new()).finalize();
                self.digests.extend_from_slice(&digest);
                self.block_filled = 0;
            }
        }
    }

    fn finalize(mut self: Box<Self>) -> String {
        if self.block_filled > 0 {
            let digest = self.block.finalize();
            self.digests.extend_from_slice(&digest);
        }
        hex::encode(Sha256::digest(&self.digests))
    }
}

/// Plain MD5, the hash Google Drive reports for uploaded bytes.
pub struct Md5Hasher {
    inner: Md5,
}

impl Md5Hasher {
    pub fn new() -> Self {
        Self { inner: Md5::new() }
    }
}

impl Default for Md5Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Receives the digest published by a [`HashTeeReader`] once its stream hits EOF.
#[derive(Clone)]
pub struct HashSink {
    slot: Arc<Mutex<Option<String>>>,
}

impl HashSink {
    pub fn take(&self) -> Option<String> {
        self.slot.lock().unwrap().take()
    }
}

/// Passes bytes through unchanged while feeding them to a [`ContentHasher`].
///
/// The tee sits directly under the upload body so the computed digest equals
/// what the provider will later report for the stored blob.
pub struct HashTeeReader<R> {
    inner: R,
    hasher: Option<Box<dyn ContentHasher + Send>>,
    slot: Arc<Mutex<Option<String>>>,
}

impl<R: AsyncRead + Unpin> HashTeeReader<R> {
    pub fn new(inner: R, hasher: Box<dyn ContentHasher + Send>) -> (Self, HashSink) {
        let slot = Arc::new(Mutex::new(None));
        let sink = HashSink { slot: slot.clone() };
        (
            Self {
                inner,
                hasher: Some(hasher),
                slot,
            },
            sink,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashTeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    if let Some(hasher) = this.hasher.take() {
                        *this.slot.lock().unwrap() = Some(hasher.finalize());
                    }
                } else if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(filled);
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}

/// Drives `reader` to EOF through `hasher` and returns the digest.
pub async fn compute_hash<R: AsyncRead + Unpin>(
    mut reader: R,
    mut hasher: Box<dyn ContentHasher + Send>,
) -> StashResult<String> {
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// MD5 hex digest of a byte stream, used for cache dirtiness checks.
pub async fn md5_checksum<R: AsyncRead + Unpin>(reader: R) -> StashResult<String> {
    compute_hash(reader, Box::new(Md5Hasher::new())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_md5_hasher() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        let hash = md5_checksum(std::io::Cursor::new(b"abc".to_vec()))
            .await
            .unwrap();
        assert_eq!(hash, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_dropbox_hasher_empty() {
        // no blocks: final hash is SHA-256 over an empty digest list
        let hash = compute_hash(
            std::io::Cursor::new(Vec::new()),
            Box::new(DropboxHasher::new()),
        )
        .await
        .unwrap();
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_dropbox_hasher_single_block() {
        use sha2::Digest as _;
        let data = vec![7u8; 1000];
        let expected = hex::encode(Sha256::digest(Sha256::digest(&data)));
        let hash = compute_hash(
            std::io::Cursor::new(data),
            Box::new(DropboxHasher::new()),
        )
        .await
        .unwrap();
        assert_eq!(hash, expected);
    }

    #[tokio::test]
    async fn test_dropbox_hasher_block_split_is_position_independent() {
        let data: Vec<u8> = (0..DROPBOX_BLOCK_SIZE + 1234).map(|i| (i % 256) as u8).collect();

        let whole = {
            let mut h = Box::new(DropboxHasher::new());
            h.update(&data);
            h.finalize()
        };
        let pieces = {
            let mut h = Box::new(DropboxHasher::new());
            for chunk in data.chunks(4096) {
                h.update(chunk);
            }
            h.finalize()
        };
        assert_eq!(whole, pieces);
    }

    #[tokio::test]
    async fn test_hash_tee_publishes_at_eof() {
        use tokio::io::AsyncReadExt;

        let data = b"stream me".to_vec();
        let (mut tee, sink) = HashTeeReader::new(
            std::io::Cursor::new(data.clone()),
            Box::new(Md5Hasher::new()),
        );

        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);

        let expected = md5_checksum(std::io::Cursor::new(data)).await.unwrap();
        assert_eq!(sink.take(), Some(expected));
        assert_eq!(sink.take(), None);
    }
}
