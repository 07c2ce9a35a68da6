use async_trait::async_trait;
use cloudstash_lib::{ContentHasher, DropboxHasher, StashError, StashResult, LOCK_FILE_NAME};
use futures_util::TryStreamExt;
use log::{debug, warn};
use rand::RngCore;
use reqwest::{Body, Client};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{lock_backoff::LockBackoff, Drive, RemoteMetadata, RemoteReader};

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Dropbox client over the HTTP API, rooted in the app folder.
pub struct Dropbox {
    client: Client,
    token: String,
    // single in-flight lock/unlock sequence per process
    lock_gate: Semaphore,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content_hash: String,
}

#[derive(Debug, Deserialize)]
struct SpaceAllocation {
    #[serde(default)]
    allocated: u64,
}

#[derive(Debug, Deserialize)]
struct SpaceUsage {
    used: u64,
    allocation: SpaceAllocation,
}

fn remote_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

impl Dropbox {
    pub fn new(access_token: &str) -> StashResult<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StashError::Remote(format!("couldn't create http client: {}", e)))?;
        Ok(Self {
            client,
            token: access_token.to_string(),
            lock_gate: Semaphore::new(1),
        })
    }

    async fn rpc(&self, endpoint: &str, body: serde_json::Value) -> StashResult<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/{}", API_BASE, endpoint))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("{} request failed: {}", endpoint, e)))?;
        Self::check_status(resp, endpoint).await
    }

    async fn check_status(
        resp: reqwest::Response,
        context: &str,
    ) -> StashResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 409 {
            // the API reports both missing paths and write races as 409
            if text.contains("not_found") {
                return Err(StashError::NotFound(format!("{}: {}", context, text)));
            }
            if text.contains("conflict") {
                return Err(StashError::Remote(format!("conflict: {}", text)));
            }
        }
        Err(StashError::from_http_status(
            status.as_u16(),
            format!("{}: {}", context, text),
        ))
    }

    async fn upload_bytes(&self, name: &str, mode: &str, content: Vec<u8>) -> StashResult<()> {
        let arg = serde_json::json!({ "path": remote_path(name), "mode": mode });
        let resp = self
            .client
            .post(format!("{}/files/upload", CONTENT_BASE))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("upload request failed: {}", e)))?;
        Self::check_status(resp, "files/upload").await?;
        Ok(())
    }
}

#[async_trait]
impl Drive for Dropbox {
    fn provider_name(&self) -> &'static str {
        "dropbox"
    }

    async fn get(&self, name: &str) -> StashResult<RemoteReader> {
        let arg = serde_json::json!({ "path": remote_path(name) });
        let resp = self
            .client
            .post(format!("{}/files/download", CONTENT_BASE))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg.to_string())
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("download request failed: {}", e)))?;
        let resp = Self::check_status(resp, "files/download").await?;

        let stream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put(&self, name: &str, reader: RemoteReader) -> StashResult<()> {
        // overwrite mode makes the upload a replace, no delete needed first
        let arg = serde_json::json!({ "path": remote_path(name), "mode": "overwrite" });
        let resp = self
            .client
            .post(format!("{}/files/upload", CONTENT_BASE))
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("upload request failed: {}", e)))?;
        Self::check_status(resp, "files/upload").await?;
        Ok(())
    }

    async fn metadata(&self, name: &str) -> StashResult<RemoteMetadata> {
        let resp = self
            .rpc(
                "files/get_metadata",
                serde_json::json!({ "path": remote_path(name) }),
            )
            .await?;
        let md: MetadataResponse = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad metadata response: {}", e)))?;
        Ok(RemoteMetadata {
            name: md.name,
            size: md.size,
            hash: md.content_hash,
        })
    }

    async fn delete(&self, name: &str) -> StashResult<()> {
        self.rpc(
            "files/delete_v2",
            serde_json::json!({ "path": remote_path(name) }),
        )
        .await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> StashResult<()> {
        self.rpc(
            "files/move_v2",
            serde_json::json!({
                "from_path": remote_path(old),
                "to_path": remote_path(new),
            }),
        )
        .await?;
        Ok(())
    }

    fn hasher(&self) -> Box<dyn ContentHasher + Send> {
        Box::new(DropboxHasher::new())
    }

    async fn lock(&self) -> StashResult<()> {
        let permit = self
            .lock_gate
            .acquire()
            .await
            .map_err(|e| StashError::Io(format!("lock gate closed: {}", e)))?;
        permit.forget();

        // the lock file needs random content, an identical upload would not
        // trigger the conflict error the protocol relies on
        let mut content = vec![0u8; 8];
        rand::thread_rng().fill_bytes(&mut content);

        let mut backoff = LockBackoff::new();
        loop {
            match self
                .upload_bytes(LOCK_FILE_NAME, "add", content.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(StashError::Remote(msg)) if msg.contains("conflict") => {
                    debug!("lock file is held, backing off");
                    if let Err(e) = backoff.wait().await {
                        self.lock_gate.add_permits(1);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.lock_gate.add_permits(1);
                    return Err(e);
                }
            }
        }
    }

    async fn unlock(&self) -> StashResult<()> {
        match self.delete(LOCK_FILE_NAME).await {
            Ok(()) | Err(StashError::NotFound(_)) => {
                self.lock_gate.add_permits(1);
                Ok(())
            }
            Err(e) => {
                warn!("couldn't delete lock file: {}", e);
                Err(e)
            }
        }
    }

    async fn available_space(&self) -> StashResult<u64> {
        let resp = self
            .client
            .post(format!("{}/users/get_space_usage", API_BASE))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("space usage request failed: {}", e)))?;
        let resp = Self::check_status(resp, "users/get_space_usage").await?;
        let usage: SpaceUsage = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad space usage response: {}", e)))?;
        Ok(usage.allocation.allocated.saturating_sub(usage.used))
    }
}
