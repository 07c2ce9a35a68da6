use cloudstash_lib::{StashError, StashResult};
use drive::OAuthToken;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_FILE: &str = "config.json";
const CONFIG_FOLDER: &str = "cloudstash";
const MOUNT_FOLDER: &str = "cloudstash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxCredentials {
    #[serde(rename = "AccessToken")]
    pub access_token: String,
}

/// On-disk configuration. Provider tokens are obtained out of band (the
/// interactive OAuth flows are not part of the daemon) and must already be
/// present; the encryption key is the derived passphrase, stored as hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "EncryptionKey")]
    pub encryption_key: String,
    #[serde(rename = "MountPoint", default)]
    pub mount_point: PathBuf,
    #[serde(rename = "Dropbox", default, skip_serializing_if = "Option::is_none")]
    pub dropbox: Option<DropboxCredentials>,
    #[serde(rename = "GDrive", default, skip_serializing_if = "Option::is_none")]
    pub gdrive: Option<OAuthToken>,
}

impl Config {
    pub fn load(cfg_dir: Option<&str>, mnt_dir: Option<&str>) -> StashResult<Config> {
        let path = config_path(cfg_dir);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            StashError::InvalidParam(format!(
                "unable to open config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut cfg: Config = serde_json::from_str(&content)
            .map_err(|e| StashError::InvalidParam(format!("unable to parse config json: {}", e)))?;

        if let Some(dir) = mnt_dir {
            cfg.mount_point = PathBuf::from(dir.trim_end_matches('/')).join(MOUNT_FOLDER);
        }
        if cfg.mount_point.as_os_str().is_empty() {
            cfg.mount_point = default_mount_point();
        }

        if cfg.encryption_key.is_empty() {
            return Err(StashError::InvalidParam(
                "config has no encryption key".to_string(),
            ));
        }
        if cfg.dropbox.is_none() && cfg.gdrive.is_none() {
            return Err(StashError::AuthFailed(
                "no provider credentials in config".to_string(),
            ));
        }

        Ok(cfg)
    }
}

fn config_path(dir: Option<&str>) -> PathBuf {
    match dir {
        Some(d) => PathBuf::from(d.trim_end_matches('/')).join(CONFIG_FILE),
        None => dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(CONFIG_FOLDER)
            .join(CONFIG_FILE),
    }
}

fn default_mount_point() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(MOUNT_FOLDER)
}
