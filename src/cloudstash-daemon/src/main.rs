mod config;
mod stash_fs;


use cloudstash_lib::{Cipher, StashError, StashResult};
use drive::{Drive, Dropbox, GDrive};
use fuser::MountOption;
use log::{error, info};
use manager::{Database, Manager, SyncOptions, SyncServer};
use std::env;
use std::sync::Arc;
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::stash_fs::CloudStashFs;

fn usage() -> String {
    "usage: cloudstash [-c <config-dir>] [-m <mount-dir>]\n\
     defaults:\n\
     -c <user config dir>/cloudstash\n\
     -m <home>/cloudstash"
        .to_string()
}

fn parse_args() -> Result<(Option<String>, Option<String>), String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut cfg_dir = None;
    let mut mnt_dir = None;

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "-c" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| "missing value for -c".to_string())?;
                cfg_dir = Some(value.clone());
            }
            "-m" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| "missing value for -m".to_string())?;
                mnt_dir = Some(value.clone());
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok((cfg_dir, mnt_dir))
}

fn collect_drives(cfg: &Config) -> StashResult<Vec<Arc<dyn Drive>>> {
    let mut drives: Vec<Arc<dyn Drive>> = Vec::new();
    if let Some(dropbox) = &cfg.dropbox {
        drives.push(Arc::new(Dropbox::new(&dropbox.access_token)?));
    }
    if let Some(token) = &cfg.gdrive {
        drives.push(Arc::new(GDrive::new(token.clone())?));
    }
    if drives.is_empty() {
        return Err(StashError::AuthFailed(
            "no provider is configured".to_string(),
        ));
    }
    Ok(drives)
}

/// Imports the remote catalog, or initializes a brand-new one on the first
/// ever mount, then wires up the manager and the two sync loops.
async fn bootstrap(cfg: &Config) -> StashResult<(Arc<Manager>, SyncServer)> {
    let cipher = Cipher::new(&cfg.encryption_key)?;
    let drives = collect_drives(cfg)?;

    // the first configured provider carries the catalog
    let catalog_drive = drives[0].clone();
    let db = match Database::fetch(catalog_drive.clone(), &cipher).await {
        Ok(db) => {
            info!("imported existing catalog");
            db
        }
        Err(e) if e.is_not_found() => {
            info!("no remote catalog found, initializing a new one");
            Database::create(catalog_drive, &cipher).await?
        }
        Err(e) => return Err(e),
    };

    let manager = Manager::new(drives, db, cipher);
    let sync = SyncServer::spawn(manager.clone(), SyncOptions::default());
    Ok((manager, sync))
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(mut sigint), Ok(mut sigterm), Ok(mut sigquit)) => {
            tokio::select! {
                _ = sigint.recv() => {},
                _ = sigterm.recv() => {},
                _ = sigquit.recv() => {},
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn main() {
    env_logger::init();

    let (cfg_dir, mnt_dir) = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let cfg = match Config::load(cfg_dir.as_deref(), mnt_dir.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("could not configure: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.mount_point) {
        error!("could not create mount directory: {}", e);
        std::process::exit(1);
    }
    info!("mount point: {}", cfg.mount_point.display());

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("could not start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let (manager, sync) = match runtime.block_on(bootstrap(&cfg)) {
        Ok(v) => v,
        Err(e) => {
            error!("could not bootstrap: {}", e);
            std::process::exit(1);
        }
    };

    let fs = CloudStashFs::new(manager.clone(), runtime.handle().clone());
    let options = [
        MountOption::FSName("cloudstash".to_string()),
        MountOption::DefaultPermissions,
    ];
    let session = match fuser::spawn_mount2(fs, &cfg.mount_point, &options) {
        Ok(session) => session,
        Err(e) => {
            error!("could not mount filesystem: {}", e);
            runtime.block_on(async {
                sync.stop().await;
                manager.shutdown().await;
            });
            std::process::exit(1);
        }
    };

    runtime.block_on(wait_for_signal());
    info!("unmounting");
    drop(session);

    runtime.block_on(async {
        sync.stop().await;
        manager.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_names_both_flags() {
        let text = usage();
        assert!(text.contains("-c"));
        assert!(text.contains("-m"));
    }
}
