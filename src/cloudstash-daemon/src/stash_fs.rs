use catalog::{Inode, ROOT_INODE};
use cloudstash_lib::StashError;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY, EPERM};
use log::{debug, warn};
use manager::Manager;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;

const TTL: Duration = Duration::from_secs(1);
const NAME_MAX: u32 = 255;
const BLOCK_SIZE: u32 = 512;

fn errno(e: &StashError) -> i32 {
    match e {
        StashError::NotFound(_) => ENOENT,
        StashError::NotDir(_) => ENOTDIR,
        StashError::IsDir(_) => EISDIR,
        StashError::DirNotEmpty(_) => ENOTEMPTY,
        StashError::Forbidden(_) => EPERM,
        _ => EIO,
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

struct OpenHandle {
    file: std::fs::File,
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    fn with_handle<F, T>(&self, fh: u64, f: F) -> Result<T, i32>
    where
        F: FnOnce(&OpenHandle) -> Result<T, i32>,
    {
        let map = self.handles.lock().map_err(|_| EIO)?;
        let handle = map.get(&fh).ok_or(EBADF)?;
        f(handle)
    }

    fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }
}

/// FUSE face of the manager. fuser drives this from its own threads, so
/// every operation hops onto the shared runtime with `block_on`.
pub struct CloudStashFs {
    pub(crate) manager: Arc<Manager>,
    runtime: Handle,
    handles: HandleTable,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl CloudStashFs {
    pub fn new(manager: Arc<Manager>, runtime: Handle) -> Self {
        Self {
            manager,
            runtime,
            handles: HandleTable::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            mounted_at: SystemTime::now(),
        }
    }

    fn build_attr(&self, md: &Inode) -> FileAttr {
        let kind = if md.kind.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: md.inode as u64,
            size: md.size,
            blocks: (md.size + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind,
            perm: md.mode & 0o7777,
            nlink: md.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    pub(crate) fn metadata_of(&self, ino: u64) -> Result<Inode, i32> {
        self.runtime
            .block_on(self.manager.metadata(ino as i64))
            .map_err(|e| errno(&e))
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let parentmd = self.metadata_of(parent)?;
        if !parentmd.kind.is_dir() {
            return Err(ENOTDIR);
        }
        let md = self
            .runtime
            .block_on(self.manager.lookup(parent as i64, name))
            .map_err(|e| errno(&e))?;
        Ok(self.build_attr(&md))
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let dirmd = self.metadata_of(ino)?;
        if !dirmd.kind.is_dir() {
            return Err(ENOTDIR);
        }

        let parent_ino = if dirmd.inode == ROOT_INODE {
            dirmd.inode
        } else {
            dirmd.parent
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino as u64, FileType::Directory, "..".to_string()),
        ];

        let children = self
            .runtime
            .block_on(self.manager.list_directory(ino as i64))
            .map_err(|e| errno(&e))?;
        for child in children {
            let kind = if child.kind.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child.inode as u64, kind, child.name));
        }

        Ok(entries
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(i, (ino, kind, name))| (ino, kind, name, (i + 1) as i64))
            .collect())
    }

    pub(crate) fn open_handle(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let accmode = flags & libc::O_ACCMODE;
        let write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;

        let file = self
            .runtime
            .block_on(self.manager.open_file(ino as i64, write))
            .map_err(|e| errno(&e))?;
        let file = self.runtime.block_on(file.into_std());
        Ok(self.handles.insert(OpenHandle { file }))
    }

    pub(crate) fn create_entry(&self, parent: u64, name: &str, mode: u32) -> Result<(FileAttr, u64), i32> {
        let md = self
            .runtime
            .block_on(
                self.manager
                    .create_file(parent as i64, name, (mode & 0o7777) as u16),
            )
            .map_err(|e| errno(&e))?;

        let file = self
            .runtime
            .block_on(self.manager.open_file(md.inode, true))
            .map_err(|e| errno(&e))?;
        let file = self.runtime.block_on(file.into_std());
        let fh = self.handles.insert(OpenHandle { file });
        Ok((self.build_attr(&md), fh))
    }

    pub(crate) fn read_handle(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        self.handles.with_handle(fh, |handle| {
            let mut buf = vec![0u8; size as usize];
            let mut total = 0usize;
            while total < buf.len() {
                let n = handle
                    .file
                    .read_at(&mut buf[total..], offset as u64 + total as u64)
                    .map_err(|e| {
                        warn!("couldn't read from cached file: {}", e);
                        EIO
                    })?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            Ok(buf)
        })
    }

    pub(crate) fn write_handle(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize, i32> {
        self.handles.with_handle(fh, |handle| {
            handle.file.write_all_at(data, offset as u64).map_err(|e| {
                warn!("couldn't write to cached file: {}", e);
                EIO
            })?;
            Ok(data.len())
        })
    }

    pub(crate) fn release_handle(&self, fh: u64) -> bool {
        self.handles.remove(fh).is_some()
    }

    pub(crate) fn unlink_entry(&self, parent: u64, name: &str) -> Result<(), i32> {
        let md = self
            .runtime
            .block_on(self.manager.lookup(parent as i64, name))
            .map_err(|e| errno(&e))?;
        self.runtime
            .block_on(self.manager.remove_file(md.inode))
            .map_err(|e| errno(&e))
    }

    pub(crate) fn rmdir_entry(&self, parent: u64, name: &str) -> Result<(), i32> {
        let md = self
            .runtime
            .block_on(self.manager.lookup(parent as i64, name))
            .map_err(|e| errno(&e))?;
        self.runtime
            .block_on(self.manager.remove_directory(md.inode))
            .map_err(|e| errno(&e))
    }

    pub(crate) fn rename_entry(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let mut md = self
            .runtime
            .block_on(self.manager.lookup(parent as i64, name))
            .map_err(|e| errno(&e))?;
        md.parent = newparent as i64;
        md.name = newname.to_string();
        self.runtime
            .block_on(self.manager.update_metadata(&md))
            .map_err(|e| errno(&e))
    }
}

impl Filesystem for CloudStashFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        debug!("lookup parent: {} name: {}", parent, name);
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!("getattr ino: {}", ino);
        match self.metadata_of(ino) {
            Ok(md) => reply.attr(&TTL, &self.build_attr(&md)),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino: {}", ino);
        let result = (|| {
            let mut md = self.metadata_of(ino)?;
            if let Some(mode) = mode {
                md.mode = (mode & 0o7777) as u16;
                self.runtime
                    .block_on(self.manager.update_metadata(&md))
                    .map_err(|e| errno(&e))?;
            }
            Ok(self.build_attr(&md))
        })();
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino: {} offset: {}", ino, offset);
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (ino, kind, name, next) in entries {
                    if reply.add(ino, next, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(name) if is_valid_name(name) => name,
            Some(_) => {
                reply.error(EPERM);
                return;
            }
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        debug!("mkdir parent: {} name: {}", parent, name);
        match self
            .runtime
            .block_on(
                self.manager
                    .add_directory(parent as i64, name, (mode & 0o7777) as u16),
            )
            .map_err(|e| errno(&e))
        {
            Ok(md) => reply.entry(&TTL, &self.build_attr(&md), 0),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("rmdir parent: {} name: {}", parent, name);
        match self.rmdir_entry(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(name) => name,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        debug!("unlink parent: {} name: {}", parent, name);
        match self.unlink_entry(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name.to_str(), newname.to_str()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(EINVAL);
                return;
            }
        };
        if !is_valid_name(newname) {
            reply.error(EPERM);
            return;
        }
        debug!("rename {} -> {}/{}", name, newparent, newname);
        match self.rename_entry(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(name) if is_valid_name(name) => name,
            Some(_) => {
                reply.error(EPERM);
                return;
            }
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        debug!("create parent: {} name: {}", parent, name);
        match self.create_entry(parent, name, mode) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino: {}", ino);
        match self.open_handle(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino: {} off: {} size: {}", ino, offset, size);
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino: {} off: {} len: {}", ino, offset, data.len());
        match self.write_handle(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush ino: {}", ino);
        match self
            .runtime
            .block_on(self.manager.update_metadata_from_cache(ino as i64))
        {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("flush couldn't update metadata of {}: {}", ino, e);
                reply.error(errno(&e));
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release ino: {}", ino);
        self.release_handle(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino: {}", ino);
        match self.metadata_of(ino) {
            Ok(md) if md.kind.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir ino: {}", ino);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            1_000_000, 1_000_000, 1_000_000, 0, 1_000_000, BLOCK_SIZE, NAME_MAX, BLOCK_SIZE,
        );
    }
}
