use async_trait::async_trait;
use cloudstash_lib::{ContentHasher, Md5Hasher, StashError, StashResult, LOCK_FILE_NAME};
use futures_util::TryStreamExt;
use log::{debug, warn};
use reqwest::{Body, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{lock_backoff::LockBackoff, Drive, RemoteMetadata, RemoteReader};

const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const ABOUT_URL: &str = "https://www.googleapis.com/drive/v3/about";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const APP_FOLDER: &str = "cloudstash";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

// installed-app credential pair, public by design for this grant type
const CLIENT_ID: &str = "943153687763-47nmcri7t4rp4j86f1vhfmnrjih5h6kb.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "EEMsb0Kf0PstcrtsFIaznlkr";

/// OAuth2 token material as persisted in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expiry: String,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileMeta {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "md5Checksum", default)]
    md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageQuota {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    usage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct About {
    #[serde(rename = "storageQuota")]
    storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Google Drive client over the v3 REST API, scoped to the app folder.
pub struct GDrive {
    client: Client,
    token: Mutex<OAuthToken>,
    root_folder: OnceCell<String>,
    // single in-flight lock/unlock sequence per process
    lock_gate: Semaphore,
    lock_id: std::sync::Mutex<Option<String>>,
}

impl GDrive {
    pub fn new(token: OAuthToken) -> StashResult<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StashError::Remote(format!("couldn't create http client: {}", e)))?;
        Ok(Self {
            client,
            token: Mutex::new(token),
            root_folder: OnceCell::new(),
            lock_gate: Semaphore::new(1),
            lock_id: std::sync::Mutex::new(None),
        })
    }

    async fn access_token(&self) -> String {
        self.token.lock().await.access_token.clone()
    }

    async fn refresh_access_token(&self) -> StashResult<()> {
        let refresh = self.token.lock().await.refresh_token.clone();
        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("refresh_token", refresh.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("token refresh failed: {}", e)))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StashError::AuthFailed(format!(
                "token refresh rejected: {}",
                text
            )));
        }

        let fresh: TokenResponse = resp
            .json()
            .await
            .map_err(|e| StashError::AuthFailed(format!("bad token response: {}", e)))?;
        self.token.lock().await.access_token = fresh.access_token;
        debug!("gdrive access token refreshed");
        Ok(())
    }

    /// Sends a rebuildable request, refreshing the access token once on 401.
    async fn send_with_auth<B>(&self, build: B) -> StashResult<reqwest::Response>
    where
        B: Fn(&Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.access_token().await;
        let resp = build(&self.client, &token)
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("gdrive request failed: {}", e)))?;
        if resp.status().as_u16() != 401 {
            return Ok(resp);
        }

        self.refresh_access_token().await?;
        let token = self.access_token().await;
        build(&self.client, &token)
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("gdrive request failed: {}", e)))
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
        Err(StashError::from_http_status(
            status.as_u16(),
            format!("{}: {}", context, text),
        ))
    }

    async fn list_by_name(&self, query: String) -> StashResult<Vec<FileRef>> {
        let resp = self
            .send_with_auth(|client, token| {
                client
                    .get(FILES_URL)
                    .bearer_auth(token)
                    .query(&[
                        ("q", query.as_str()),
                        ("fields", "files(id, name)"),
                        ("pageSize", "10"),
                    ])
            })
            .await?;
        let resp = Self::check_status(resp, "files.list").await?;
        let list: FileList = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad list response: {}", e)))?;
        Ok(list.files)
    }

    async fn ensure_root_folder(&self) -> StashResult<&str> {
        let id = self
            .root_folder
            .get_or_try_init(|| async {
                let found = self
                    .list_by_name(format!(
                        "name = '{}' and mimeType = '{}' and trashed = false",
                        APP_FOLDER, FOLDER_MIME
                    ))
                    .await?;
                if let Some(folder) = found.into_iter().next() {
                    return Ok::<_, StashError>(folder.id);
                }

                let resp = self
                    .send_with_auth(|client, token| {
                        client.post(FILES_URL).bearer_auth(token).json(
                            &serde_json::json!({ "name": APP_FOLDER, "mimeType": FOLDER_MIME }),
                        )
                    })
                    .await?;
                let resp = Self::check_status(resp, "create app folder").await?;
                let created: FileRef = resp
                    .json()
                    .await
                    .map_err(|e| StashError::Remote(format!("bad create response: {}", e)))?;
                Ok(created.id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn find_file_id(&self, name: &str) -> StashResult<String> {
        let folder = self.ensure_root_folder().await?;
        let files = self
            .list_by_name(format!(
                "name = '{}' and '{}' in parents and trashed = false",
                name, folder
            ))
            .await?;

        match files.len() {
            0 => Err(StashError::NotFound(format!("no gdrive file '{}'", name))),
            1 => Ok(files.into_iter().next().unwrap().id),
            n => Err(StashError::Remote(format!(
                "unexpected number of gdrive files named '{}': {}",
                name, n
            ))),
        }
    }

    async fn delete_by_id(&self, id: &str) -> StashResult<()> {
        let url = format!("{}/{}", FILES_URL, id);
        let resp = self
            .send_with_auth(|client, token| client.delete(&url).bearer_auth(token))
            .await?;
        Self::check_status(resp, "files.delete").await?;
        Ok(())
    }

    async fn create_empty_file(&self, name: &str) -> StashResult<String> {
        let folder = self.ensure_root_folder().await?;
        let body = serde_json::json!({ "name": name, "parents": [folder] });
        let resp = self
            .send_with_auth(|client, token| {
                client.post(FILES_URL).bearer_auth(token).json(&body)
            })
            .await?;
        let resp = Self::check_status(resp, "files.create").await?;
        let created: FileRef = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad create response: {}", e)))?;
        Ok(created.id)
    }
}

#[async_trait]
impl Drive for GDrive {
    fn provider_name(&self) -> &'static str {
        "gdrive"
    }

    async fn get(&self, name: &str) -> StashResult<RemoteReader> {
        let id = self.find_file_id(name).await?;
        let url = format!("{}/{}", FILES_URL, id);
        let resp = self
            .send_with_auth(|client, token| {
                client.get(&url).bearer_auth(token).query(&[("alt", "media")])
            })
            .await?;
        let resp = Self::check_status(resp, "files.get media").await?;

        let stream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put(&self, name: &str, reader: RemoteReader) -> StashResult<()> {
        // uploads don't replace, an existing blob has to go first
        match self.find_file_id(name).await {
            Ok(id) => self.delete_by_id(&id).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let folder = self.ensure_root_folder().await?.to_string();
        let token = self.access_token().await;
        let resp = self
            .client
            .post(format!("{}?uploadType=media", UPLOAD_URL))
            .bearer_auth(&token)
            .header("Content-Type", "application/octet-stream")
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await
            .map_err(|e| StashError::Remote(format!("upload request failed: {}", e)))?;
        let resp = Self::check_status(resp, "files.create media").await?;
        let created: FileRef = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad upload response: {}", e)))?;

        // media uploads land unnamed in the drive root, move into place
        let url = format!("{}/{}", FILES_URL, created.id);
        let body = serde_json::json!({ "name": name });
        let resp = self
            .send_with_auth(|client, token| {
                client
                    .patch(&url)
                    .bearer_auth(token)
                    .query(&[("addParents", folder.as_str()), ("removeParents", "root")])
                    .json(&body)
            })
            .await?;
        Self::check_status(resp, "files.update").await?;
        Ok(())
    }

    async fn metadata(&self, name: &str) -> StashResult<RemoteMetadata> {
        let id = self.find_file_id(name).await?;
        let url = format!("{}/{}", FILES_URL, id);
        let resp = self
            .send_with_auth(|client, token| {
                client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("fields", "name, size, md5Checksum")])
            })
            .await?;
        let resp = Self::check_status(resp, "files.get").await?;
        let md: FileMeta = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad metadata response: {}", e)))?;

        Ok(RemoteMetadata {
            name: md.name,
            size: md
                .size
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or_default(),
            hash: md.md5_checksum.unwrap_or_default(),
        })
    }

    async fn delete(&self, name: &str) -> StashResult<()> {
        let id = self.find_file_id(name).await?;
        self.delete_by_id(&id).await
    }

    async fn rename(&self, old: &str, new: &str) -> StashResult<()> {
        let id = self.find_file_id(old).await?;
        let url = format!("{}/{}", FILES_URL, id);
        let body = serde_json::json!({ "name": new });
        let resp = self
            .send_with_auth(|client, token| client.patch(&url).bearer_auth(token).json(&body))
            .await?;
        Self::check_status(resp, "files.update").await?;
        Ok(())
    }

    fn hasher(&self) -> Box<dyn ContentHasher + Send> {
        Box::new(Md5Hasher::new())
    }

    async fn lock(&self) -> StashResult<()> {
        let permit = self
            .lock_gate
            .acquire()
            .await
            .map_err(|e| StashError::Io(format!("lock gate closed: {}", e)))?;
        permit.forget();

        let result = self.lock_inner().await;
        if result.is_err() {
            self.lock_gate.add_permits(1);
        }
        result
    }

    async fn unlock(&self) -> StashResult<()> {
        let id = self.lock_id.lock().unwrap().take();
        if let Some(id) = id {
            match self.delete_by_id(&id).await {
                Ok(()) | Err(StashError::NotFound(_)) => {}
                Err(e) => {
                    warn!("couldn't delete lock file: {}", e);
                    return Err(e);
                }
            }
        }
        self.lock_gate.add_permits(1);
        Ok(())
    }

    async fn available_space(&self) -> StashResult<u64> {
        let resp = self
            .send_with_auth(|client, token| {
                client
                    .get(ABOUT_URL)
                    .bearer_auth(token)
                    .query(&[("fields", "storageQuota(limit, usage)")])
            })
            .await?;
        let resp = Self::check_status(resp, "about.get").await?;
        let about: About = resp
            .json()
            .await
            .map_err(|e| StashError::Remote(format!("bad about response: {}", e)))?;

        let usage = about
            .storage_quota
            .usage
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        match about.storage_quota.limit.and_then(|s| s.parse::<u64>().ok()) {
            Some(limit) => Ok(limit.saturating_sub(usage)),
            // unlimited plans report no limit
            None => Ok(u64::MAX / 2),
        }
    }
}

impl GDrive {
    /// Create-then-recount lock protocol: anyone can create `lock.file`, so
    /// after creating our own we re-query and back out if another client won.
    async fn lock_inner(&self) -> StashResult<()> {
        let mut backoff = LockBackoff::new();
        loop {
            let existing = self
                .list_by_name(format!("name = '{}' and trashed = false", LOCK_FILE_NAME))
                .await?;
            if !existing.is_empty() {
                debug!("lock file is held, backing off");
                backoff.wait_jittered().await?;
                continue;
            }

            let own_id = self.create_empty_file(LOCK_FILE_NAME).await?;
            let now = self
                .list_by_name(format!("name = '{}' and trashed = false", LOCK_FILE_NAME))
                .await?;
            if now.len() == 1 {
                *self.lock_id.lock().unwrap() = Some(own_id);
                return Ok(());
            }

            // lost the race, clean up before retrying
            if let Err(e) = self.delete_by_id(&own_id).await {
                warn!("couldn't delete own lock file after race: {}", e);
                return Err(e);
            }
            backoff.wait_jittered().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_meta_size_is_a_string() {
        // the drive API serializes int64 fields as JSON strings
        let md: FileMeta = serde_json::from_str(
            r#"{ "name": "blob.dat", "size": "4096", "md5Checksum": "d41d" }"#,
        )
        .unwrap();
        assert_eq!(md.size.as_deref(), Some("4096"));
        assert_eq!(md.md5_checksum.as_deref(), Some("d41d"));

        let folder: FileMeta = serde_json::from_str(r#"{ "name": "cloudstash" }"#).unwrap();
        assert!(folder.size.is_none());
        assert!(folder.md5_checksum.is_none());
    }

    #[test]
    fn test_about_quota_parsing() {
        let about: About = serde_json::from_str(
            r#"{ "storageQuota": { "limit": "1000", "usage": "250" } }"#,
        )
        .unwrap();
        assert_eq!(about.storage_quota.limit.as_deref(), Some("1000"));
        assert_eq!(about.storage_quota.usage.as_deref(), Some("250"));

        // unlimited plans omit the limit entirely
        let about: About =
            serde_json::from_str(r#"{ "storageQuota": { "usage": "250" } }"#).unwrap();
        assert!(about.storage_quota.limit.is_none());
    }

    #[test]
    fn test_oauth_token_round_trip() {
        let json = r#"{
            "access_token": "ya29.a0",
            "refresh_token": "1//rt",
            "token_type": "Bearer",
            "expiry": "2026-03-01T10:00:00Z"
        }"#;
        let token: OAuthToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "ya29.a0");
        assert_eq!(token.refresh_token, "1//rt");

        let back = serde_json::to_string(&token).unwrap();
        let again: OAuthToken = serde_json::from_str(&back).unwrap();
        assert_eq!(again.expiry, token.expiry);
    }

    #[test]
    fn test_empty_file_list_parses() {
        let list: FileList = serde_json::from_str(r#"{}"#).unwrap();
        assert!(list.files.is_empty());
    }
}
