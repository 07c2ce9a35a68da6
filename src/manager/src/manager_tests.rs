use crate::{Database, FileState, Manager, SyncOptions, SyncServer};
use catalog::ROOT_INODE;
use cloudstash_lib::{Cipher, FileUrl, StashError, CATALOG_FILE_NAME};
use drive::{Drive, MemDrive};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_cipher() -> Cipher {
    Cipher::new(&"07".repeat(32)).unwrap()
}

/// Builds a manager against the shared drive, fetching the remote catalog or
/// bootstrapping a fresh one, the way the daemon does at startup.
async fn new_client(drv: &Arc<MemDrive>) -> Arc<Manager> {
    let drive: Arc<dyn Drive> = drv.clone();
    let cipher = test_cipher();
    let db = match Database::fetch(drive.clone(), &cipher).await {
        Ok(db) => db,
        Err(e) if e.is_not_found() => Database::create(drive.clone(), &cipher).await.unwrap(),
        Err(e) => panic!("bootstrap failed: {}", e),
    };
    Manager::new(vec![drive], db, cipher)
}

async fn write_content(m: &Manager, inode: i64, content: &[u8]) {
    let mut file = m.open_file(inode, true).await.unwrap();
    file.write_all(content).await.unwrap();
    file.flush().await.unwrap();
    drop(file);
    m.update_metadata_from_cache(inode).await.unwrap();
}

async fn read_content(m: &Manager, inode: i64) -> Vec<u8> {
    let mut file = m.open_file(inode, false).await.unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn test_fresh_install_bootstraps_remote_catalog() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    assert!(drv.raw_blob(CATALOG_FILE_NAME).is_some());

    let root = m.metadata(ROOT_INODE).await.unwrap();
    assert!(root.kind.is_dir());
    assert!(m.list_directory(ROOT_INODE).await.unwrap().is_empty());

    m.shutdown().await;
}

#[tokio::test]
async fn test_create_write_flush_read_round_trip() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    let md = m.create_file(ROOT_INODE, "hello", 0o644).await.unwrap();
    write_content(&m, md.inode, b"abc\n").await;

    let updated = m.metadata(md.inode).await.unwrap();
    assert_eq!(updated.size, 4);
    assert_eq!(updated.nlink, 1);

    assert_eq!(read_content(&m, md.inode).await, b"abc\n");

    // unmount and remount as a second client
    m.push_all_now().await;
    let m2 = new_client(&drv).await;
    let found = m2.lookup(ROOT_INODE, "hello").await.unwrap();
    assert_eq!(found.size, 4);
    assert_eq!(read_content(&m2, found.inode).await, b"abc\n");
}

#[tokio::test]
async fn test_pushed_blob_is_encrypted_at_rest() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    let md = m.create_file(ROOT_INODE, "secret.txt", 0o644).await.unwrap();
    write_content(&m, md.inode, b"plaintext secret").await;
    m.push_all_now().await;

    let url = FileUrl::parse(&md.url).unwrap();
    let blob = drv.raw_blob(&url.name).expect("blob was uploaded");
    assert_ne!(blob, b"plaintext secret".to_vec());
    assert!(!blob
        .windows(b"plaintext".len())
        .any(|w| w == b"plaintext"));

    // catalog row hash tracks the plaintext checksum
    let row = m.metadata(md.inode).await.unwrap();
    let sum = cloudstash_lib::md5_checksum(std::io::Cursor::new(b"plaintext secret".to_vec()))
        .await
        .unwrap();
    assert_eq!(row.hash, sum);
}

#[tokio::test]
async fn test_two_client_concurrent_create_converges() {
    let drv = Arc::new(MemDrive::new());

    // both clients start from the same (empty) remote catalog
    let ma = new_client(&drv).await;
    let mb = new_client(&drv).await;

    // client A burns an inode so the two namespaces don't collide numerically
    let scratch = ma.create_file(ROOT_INODE, "scratch", 0o644).await.unwrap();
    ma.remove_file(scratch.inode).await.unwrap();

    let a = ma.create_file(ROOT_INODE, "a.txt", 0o644).await.unwrap();
    write_content(&ma, a.inode, b"from a").await;
    ma.push_all_now().await;

    let b = mb.create_file(ROOT_INODE, "b.txt", 0o644).await.unwrap();
    write_content(&mb, b.inode, b"from b").await;
    // B's push discovers the diverged remote catalog and merges
    mb.push_all_now().await;

    let mc = new_client(&drv).await;
    let names: Vec<String> = mc
        .list_directory(ROOT_INODE)
        .await
        .unwrap()
        .into_iter()
        .map(|md| md.name)
        .collect();
    assert!(names.contains(&"a.txt".to_string()), "a.txt lost: {:?}", names);
    assert!(names.contains(&"b.txt".to_string()), "b.txt lost: {:?}", names);

    // the superseded remote catalog was kept as a conflicted copy
    assert!(drv
        .blob_names()
        .iter()
        .any(|n| n.starts_with("conflicted_copy_") && n.ends_with(CATALOG_FILE_NAME)));
}

#[tokio::test]
async fn test_same_inode_collision_keeps_local_row() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;
    let mb = new_client(&drv).await;

    // both clients allocate inode 2 under the same parent; the merge
    // heuristic sees a partial difference and the merging writer wins
    let a = ma.create_file(ROOT_INODE, "a.txt", 0o644).await.unwrap();
    write_content(&ma, a.inode, b"from a").await;
    ma.push_all_now().await;

    let b = mb.create_file(ROOT_INODE, "b.txt", 0o644).await.unwrap();
    assert_eq!(a.inode, b.inode);
    write_content(&mb, b.inode, b"from b").await;
    mb.push_all_now().await;

    let mc = new_client(&drv).await;
    let names: Vec<String> = mc
        .list_directory(ROOT_INODE)
        .await
        .unwrap()
        .into_iter()
        .map(|md| md.name)
        .collect();
    assert!(names.contains(&"b.txt".to_string()));
    assert!(!names.contains(&"a.txt".to_string()));
}

#[tokio::test]
async fn test_pull_invalidates_stale_cache() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;

    let md = ma.create_file(ROOT_INODE, "shared", 0o644).await.unwrap();
    write_content(&ma, md.inode, b"v1").await;
    ma.push_all_now().await;

    let mb = new_client(&drv).await;
    assert_eq!(read_content(&mb, md.inode).await, b"v1");
    assert!(mb.cache().get(&md.inode.to_string()).is_some());

    write_content(&ma, md.inode, b"v2!").await;
    ma.push_all_now().await;

    mb.pull_tick().await;
    assert!(
        mb.cache().get(&md.inode.to_string()).is_none(),
        "stale cache entry survived the pull"
    );
    assert_eq!(read_content(&mb, md.inode).await, b"v2!");
}

#[tokio::test]
async fn test_tampered_blob_fails_to_open() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;

    let md = ma.create_file(ROOT_INODE, "victim", 0o644).await.unwrap();
    write_content(&ma, md.inode, b"sensitive content").await;
    ma.push_all_now().await;

    let url = FileUrl::parse(&md.url).unwrap();
    let mut blob = drv.raw_blob(&url.name).unwrap();
    let mid = blob.len() / 2;
    blob[mid] ^= 0x01;
    drv.store_raw(&url.name, blob);

    // a client with a cold cache has to download the tampered bytes
    let mb = new_client(&drv).await;
    let err = mb.open_file(md.inode, false).await.unwrap_err();
    assert!(matches!(err, StashError::Io(_)));
    assert!(mb.cache().get(&md.inode.to_string()).is_none());
}

#[tokio::test]
async fn test_remove_file_is_idempotent() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    let md = m.create_file(ROOT_INODE, "gone", 0o644).await.unwrap();
    m.remove_file(md.inode).await.unwrap();
    m.remove_file(md.inode).await.unwrap();
    assert!(m.metadata(md.inode).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_directory_lifecycle() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    let dir = m.add_directory(ROOT_INODE, "d", 0o755).await.unwrap();
    m.remove_directory(dir.inode).await.unwrap();

    let dir = m.add_directory(ROOT_INODE, "d", 0o755).await.unwrap();
    let child = m.create_file(dir.inode, "x", 0o644).await.unwrap();
    assert!(matches!(
        m.remove_directory(dir.inode).await.unwrap_err(),
        StashError::DirNotEmpty(_)
    ));

    m.remove_file(child.inode).await.unwrap();
    m.remove_directory(dir.inode).await.unwrap();
}

#[tokio::test]
async fn test_rename_across_directories() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;

    let da = ma.add_directory(ROOT_INODE, "a", 0o755).await.unwrap();
    let db_ = ma.add_directory(ROOT_INODE, "b", 0o755).await.unwrap();
    let md = ma.create_file(da.inode, "x", 0o644).await.unwrap();
    write_content(&ma, md.inode, b"payload").await;

    let mut moved = ma.metadata(md.inode).await.unwrap();
    moved.parent = db_.inode;
    moved.name = "y".to_string();
    ma.update_metadata(&moved).await.unwrap();
    ma.push_all_now().await;

    let mb = new_client(&drv).await;
    assert!(mb.lookup(da.inode, "x").await.unwrap_err().is_not_found());
    let found = mb.lookup(db_.inode, "y").await.unwrap();
    assert_eq!(found.hash, md5_of(b"payload").await);
    assert_eq!(read_content(&mb, found.inode).await, b"payload");
}

#[tokio::test]
async fn test_forbidden_names_are_rejected() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    for bad in [".", "..", "a/b", ""] {
        assert!(matches!(
            m.create_file(ROOT_INODE, bad, 0o644).await.unwrap_err(),
            StashError::Forbidden(_)
        ));
        assert!(matches!(
            m.add_directory(ROOT_INODE, bad, 0o755).await.unwrap_err(),
            StashError::Forbidden(_)
        ));
    }
}

#[tokio::test]
async fn test_list_directory_rejects_files() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;
    let md = m.create_file(ROOT_INODE, "plain", 0o644).await.unwrap();
    assert!(matches!(
        m.list_directory(md.inode).await.unwrap_err(),
        StashError::NotDir(_)
    ));
    assert!(matches!(
        m.open_file(ROOT_INODE, false).await.unwrap_err(),
        StashError::IsDir(_)
    ));
}

#[tokio::test]
async fn test_failed_upload_stays_tracked() {
    let drv = Arc::new(MemDrive::new());
    let m = new_client(&drv).await;

    let md = m.create_file(ROOT_INODE, "flaky", 0o644).await.unwrap();
    write_content(&m, md.inode, b"retry me").await;

    drv.set_fail_puts(true);
    m.push_all_now().await;
    assert!(!m.tracker().is_empty(), "failed entries must be re-enqueued");

    drv.set_fail_puts(false);
    m.push_all_now().await;
    assert!(m.tracker().is_empty());

    // connectivity is back, a fresh client reads the content
    let m2 = new_client(&drv).await;
    assert_eq!(read_content(&m2, md.inode).await, b"retry me");
}

#[tokio::test]
async fn test_concurrent_open_single_download() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;
    let md = ma.create_file(ROOT_INODE, "hot", 0o644).await.unwrap();
    write_content(&ma, md.inode, b"contended").await;
    ma.push_all_now().await;

    let mb = new_client(&drv).await;
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let mb = mb.clone();
        let inode = md.inode;
        tasks.push(tokio::spawn(async move {
            let mut file = mb.open_file(inode, false).await.unwrap();
            let mut out = Vec::new();
            file.read_to_end(&mut out).await.unwrap();
            out
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), b"contended");
    }

    // exactly one Available entry backs all the opens
    match mb.cache().get(&md.inode.to_string()).unwrap().state {
        FileState::Available(_) => {}
        other => panic!("unexpected cache state {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_server_round_trip() {
    let drv = Arc::new(MemDrive::new());
    let ma = new_client(&drv).await;

    let sync = SyncServer::spawn(
        ma.clone(),
        SyncOptions {
            pull_interval: std::time::Duration::from_millis(50),
            push_interval: std::time::Duration::from_millis(20),
        },
    );

    let md = ma.create_file(ROOT_INODE, "bg", 0o644).await.unwrap();
    write_content(&ma, md.inode, b"pushed by the loop").await;

    // the push loop only drains entries idle for 10s, so force the flush
    ma.push_all_now().await;
    sync.stop().await;

    let mb = new_client(&drv).await;
    assert_eq!(read_content(&mb, md.inode).await, b"pushed by the loop");
}

async fn md5_of(content: &[u8]) -> String {
    cloudstash_lib::md5_checksum(std::io::Cursor::new(content.to_vec()))
        .await
        .unwrap()
}
