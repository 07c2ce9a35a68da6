use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::{StashError, StashResult};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Plaintext bytes carried by one encrypted frame.
pub const CIPHER_CHUNK_SIZE: usize = 4 * 1024;

const MAC_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const FRAME_SIZE: usize = MAC_SIZE + IV_SIZE + CIPHER_CHUNK_SIZE;

const ITERATION_COUNT: u32 = 1_000_000;
const KEY_LENGTH: usize = 32;

// Must stay byte-identical to deployed clients or existing blobs become unreadable.
const SALT: [u8; 16] = [
    0x32, 0x24, 0x45, 0xa3, 0xb3, 0x89, 0x83, 0x56, 0x24, 0x66, 0x61, 0x18, 0x19, 0xc2, 0xff, 0xd0,
];

/// Derives the symmetric key from a user passphrase, returned as lowercase hex.
pub fn derive_key(passphrase: &[u8]) -> String {
    let mut derived = [0u8; KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(passphrase, &SALT, ITERATION_COUNT, &mut derived);
    hex::encode(derived)
}

/// Symmetric stream cipher over 4 KiB plaintext chunks.
///
/// Each frame on the wire is `HMAC-SHA256(key, plaintext) || IV || CTR(key, IV, plaintext)`.
/// The final short chunk is emitted without padding, so ciphertext length is
/// plaintext length plus 48 bytes of overhead per started chunk.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LENGTH],
}

impl Cipher {
    pub fn new(hex_key: &str) -> StashResult<Self> {
        let decoded = hex::decode(hex_key)
            .map_err(|e| StashError::InvalidParam(format!("bad encryption key: {}", e)))?;
        if decoded.len() != KEY_LENGTH {
            return Err(StashError::InvalidParam(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LENGTH,
                decoded.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&decoded);
        Ok(Self { key })
    }

    /// Wraps `inner` so that reading yields the encrypted stream.
    pub fn encrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> EncryptReader<R> {
        EncryptReader {
            inner,
            key: self.key,
            plain: vec![0u8; CIPHER_CHUNK_SIZE].into_boxed_slice(),
            plain_len: 0,
            inner_eof: false,
            frame: Vec::new(),
            frame_pos: 0,
        }
    }

    /// Wraps `inner` so that reading yields the verified plaintext stream.
    ///
    /// A MAC mismatch or truncated frame surfaces as `InvalidData` before any
    /// byte of the offending frame is emitted.
    pub fn decrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> DecryptReader<R> {
        DecryptReader {
            inner,
            key: self.key,
            frame: vec![0u8; FRAME_SIZE].into_boxed_slice(),
            frame_len: 0,
            inner_eof: false,
            plain: Vec::new(),
            plain_pos: 0,
            failed: false,
        }
    }
}

fn compute_hmac(key: &[u8], chunk: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(chunk);
    mac.finalize().into_bytes().into()
}

fn verify_hmac(key: &[u8], chunk: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(chunk);
    // verify_slice is a constant-time comparison
    mac.verify_slice(tag).is_ok()
}

pub struct EncryptReader<R> {
    inner: R,
    key: [u8; KEY_LENGTH],
    plain: Box<[u8]>,
    plain_len: usize,
    inner_eof: bool,
    frame: Vec<u8>,
    frame_pos: usize,
}

impl<R> EncryptReader<R> {
    fn seal_frame(&mut self) {
        let n = self.plain_len;
        let mac = compute_hmac(&self.key, &self.plain[..n]);

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut body = self.plain[..n].to_vec();
        let mut enc = Aes256Ctr::new(&self.key.into(), &iv.into());
        enc.apply_keystream(&mut body);

        self.frame.clear();
        self.frame.reserve(MAC_SIZE + IV_SIZE + n);
        self.frame.extend_from_slice(&mac);
        self.frame.extend_from_slice(&iv);
        self.frame.extend_from_slice(&body);
        self.frame_pos = 0;
        self.plain_len = 0;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.frame_pos < this.frame.len() {
                let n = buf.remaining().min(this.frame.len() - this.frame_pos);
                buf.put_slice(&this.frame[this.frame_pos..this.frame_pos + n]);
                this.frame_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.inner_eof && this.plain_len == 0 {
                return Poll::Ready(Ok(()));
            }

            while !this.inner_eof && this.plain_len < CIPHER_CHUNK_SIZE {
                let mut rb = ReadBuf::new(&mut this.plain[this.plain_len..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            this.inner_eof = true;
                        } else {
                            this.plain_len += n;
                        }
                    }
                }
            }

            if this.plain_len > 0 {
                this.seal_frame();
            }
        }
    }
}

pub struct DecryptReader<R> {
    inner: R,
    key: [u8; KEY_LENGTH],
    frame: Box<[u8]>,
    frame_len: usize,
    inner_eof: bool,
    plain: Vec<u8>,
    plain_pos: usize,
    failed: bool,
}

impl<R> DecryptReader<R> {
    fn open_frame(&mut self) -> io::Result<()> {
        let total = self.frame_len;
        if total < MAC_SIZE + IV_SIZE + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated cipher frame",
            ));
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.frame[MAC_SIZE..MAC_SIZE + IV_SIZE]);

        let mut body = self.frame[MAC_SIZE + IV_SIZE..total].to_vec();
        let mut dec = Aes256Ctr::new(&self.key.into(), &iv.into());
        dec.apply_keystream(&mut body);

        if !verify_hmac(&self.key, &body, &self.frame[..MAC_SIZE]) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "content authentication failed, blob may be altered",
            ));
        }

        self.plain = body;
        self.plain_pos = 0;
        self.frame_len = 0;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plain_pos < this.plain.len() {
                let n = buf.remaining().min(this.plain.len() - this.plain_pos);
                buf.put_slice(&this.plain[this.plain_pos..this.plain_pos + n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.failed {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "cipher stream already failed",
                )));
            }

            if this.inner_eof && this.frame_len == 0 {
                return Poll::Ready(Ok(()));
            }

            while !this.inner_eof && this.frame_len < FRAME_SIZE {
                let mut rb = ReadBuf::new(&mut this.frame[this.frame_len..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {
                        let n = rb.filled().len();
                        if n == 0 {
                            this.inner_eof = true;
                        } else {
                            this.frame_len += n;
                        }
                    }
                }
            }

            if this.frame_len == 0 {
                continue;
            }

            if let Err(e) = this.open_frame() {
                this.failed = true;
                return Poll::Ready(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_cipher() -> Cipher {
        let key = [0x42u8; KEY_LENGTH];
        Cipher::new(&hex::encode(key)).unwrap()
    }

    async fn encrypt_all(cipher: &Cipher, data: &[u8]) -> Vec<u8> {
        let mut reader = cipher.encrypt_reader(std::io::Cursor::new(data.to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    async fn decrypt_all(cipher: &Cipher, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = cipher.decrypt_reader(std::io::Cursor::new(data.to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let cipher = test_cipher();
        for len in [0usize, 1, 4095, 4096, 4097, 1024 * 1024 + 13] {
            let data = patterned(len);
            let ct = encrypt_all(&cipher, &data).await;
            let pt = decrypt_all(&cipher, &ct).await.unwrap();
            assert_eq!(pt, data, "round trip failed for len {}", len);
        }
    }

    #[tokio::test]
    async fn test_frame_overhead() {
        let cipher = test_cipher();
        // one full chunk and a short trailing chunk, 48 bytes overhead each
        let data = patterned(CIPHER_CHUNK_SIZE + 10);
        let ct = encrypt_all(&cipher, &data).await;
        assert_eq!(ct.len(), data.len() + 2 * (MAC_SIZE + IV_SIZE));

        let empty = encrypt_all(&cipher, &[]).await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_tamper_detection() {
        let cipher = test_cipher();
        let data = patterned(CIPHER_CHUNK_SIZE * 2 + 100);
        let ct = encrypt_all(&cipher, &data).await;

        // flip one byte in the MAC, the IV and the body of different frames
        for idx in [0usize, MAC_SIZE + 3, MAC_SIZE + IV_SIZE + 17, FRAME_SIZE + 5] {
            let mut bad = ct.clone();
            bad[idx] ^= 0x01;
            let err = decrypt_all(&cipher, &bad).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData, "tamper at {}", idx);
        }
    }

    #[tokio::test]
    async fn test_no_partial_plaintext_from_bad_frame() {
        let cipher = test_cipher();
        let data = patterned(100);
        let mut ct = encrypt_all(&cipher, &data).await;
        ct[MAC_SIZE + IV_SIZE] ^= 0xff;

        let mut reader = cipher.decrypt_reader(std::io::Cursor::new(ct));
        let mut out = Vec::new();
        let res = reader.read_to_end(&mut out).await;
        assert!(res.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_rejected() {
        let cipher = test_cipher();
        let ct = encrypt_all(&cipher, &patterned(200)).await;
        let err = decrypt_all(&cipher, &ct[..MAC_SIZE + 4]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(Cipher::new("not-hex").is_err());
        assert!(Cipher::new("abcd").is_err());
    }
}
