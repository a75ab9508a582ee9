//! FUSE adapter
//!
//! Translates kernel requests into mount runtime calls. fuser invokes the
//! callbacks on its own thread, so each request blocks on the tokio
//! runtime that drives the object store.

use super::handle::{list_directory, page, HandleTable};
use crate::error::{Error, Result};
use crate::inodes::{Inode, InodeAttributes, InodeNumber, DIR_BLOCK_SIZE};
use crate::model::EntryKind;
use crate::mount::MountRuntime;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::{c_int, EINVAL};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const TTL: Duration = Duration::from_secs(1);

/// Longest name accepted in a directory entry
const MAX_NAME_LEN: u32 = 255;

pub struct FuseBridge {
    mount: Arc<MountRuntime>,
    runtime: Handle,
    handles: HandleTable,
}

impl FuseBridge {
    pub fn new(mount: Arc<MountRuntime>, runtime: Handle) -> Self {
        FuseBridge {
            mount,
            runtime,
            handles: HandleTable::new(),
        }
    }

    pub fn mount(&self) -> &Arc<MountRuntime> {
        &self.mount
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Generation passed back in every entry reply
    fn generation(&self) -> u64 {
        self.mount.generation().get()
    }

    fn inode(&self, ino: u64) -> Result<Inode> {
        self.mount.get_inode(InodeNumber::new(ino))
    }

    fn directory(&self, ino: u64) -> Result<Arc<crate::inodes::TreeInode>> {
        Ok(self.inode(ino)?.as_directory()?.clone())
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    async fn entry_attr(&self, inode: &Inode) -> Result<FileAttr> {
        Ok(to_file_attr(&inode.get_attributes().await?))
    }
}

fn name_str(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not valid UTF-8", name)))
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Regular | EntryKind::Executable => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Directory => FileType::Directory,
    }
}

/// Convert inode attributes to the kernel representation
pub fn to_file_attr(attrs: &InodeAttributes) -> FileAttr {
    FileAttr {
        ino: attrs.ino.get(),
        size: attrs.size,
        blocks: attrs.blocks(),
        atime: attrs.times.atime,
        mtime: attrs.times.mtime,
        ctime: attrs.times.ctime,
        crtime: attrs.times.ctime,
        kind: file_type(attrs.kind),
        perm: attrs.perm,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: DIR_BLOCK_SIZE as u32,
        flags: 0,
    }
}

fn errno(op: &str, e: &Error) -> c_int {
    if e.is_fatal() || matches!(e, Error::Io(_) | Error::Internal(_)) {
        warn!("{} failed: {}", op, e);
    } else {
        debug!("{} failed: {}", op, e);
    }
    e.errno()
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!("FUSE session started (generation {})", self.mount.generation());
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.mount.shutdown() {
            warn!("Shutdown after unmount failed: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            let inode = dir.lookup_child(name_str(name)?).await?;
            self.entry_attr(&inode).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, self.generation()),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        let result = self.block_on(async {
            let inode = self.inode(ino)?;
            self.entry_attr(&inode).await
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
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
        debug!("setattr(ino={}, size={:?})", ino, size);

        // Only size changes are supported; modes and owners are fixed
        let result = self.block_on(async {
            let inode = self.inode(ino)?;
            if let Some(size) = size {
                inode.as_file()?.truncate(size).await?;
            }
            self.entry_attr(&inode).await
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        let result = self.block_on(async {
            let inode = self.inode(ino)?;
            inode.as_symlink()?.readlink().await
        });
        match result {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);

        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            let child = Inode::Directory(dir.mkdir(name_str(name)?).await?);
            self.entry_attr(&child).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, self.generation()),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            dir.unlink(name_str(name)?).await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            dir.rmdir(name_str(name)?).await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, link={:?})", parent, name, link);

        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            let target = link.to_str().ok_or_else(|| {
                Error::InvalidArgument(format!("{:?} is not valid UTF-8", link))
            })?;
            let child = dir.symlink(name_str(name)?, target).await?;
            self.entry_attr(&child).await
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, self.generation()),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let result = self.block_on(async {
            let source = self.directory(parent)?;
            let dest = self.directory(newparent)?;
            source
                .rename(name_str(name)?, &dest, name_str(newname)?)
                .await
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        let result = self.block_on(async {
            let inode = self.inode(ino)?;
            let file = inode.as_file()?;
            if flags & libc::O_TRUNC != 0 {
                file.truncate(0).await?;
            }
            Ok::<_, Error>(inode)
        });
        match result {
            Ok(inode) => reply.opened(self.handles.open(inode, flags), 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let handle = match self.handles.get(fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        if !handle.is_readable() {
            reply.error(libc::EBADF);
            return;
        }
        let result = self.block_on(async {
            let offset = u64::try_from(offset)
                .map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))?;
            handle.inode.as_file()?.read(offset, size as usize).await
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let handle = match self.handles.get(fh) {
            Some(h) => h,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        if !handle.is_writable() {
            reply.error(libc::EBADF);
            return;
        }
        let result = self.block_on(async {
            let file = handle.inode.as_file()?;
            let offset = if handle.is_append() {
                file.get_attributes().await?.size
            } else {
                u64::try_from(offset)
                    .map_err(|_| Error::InvalidArgument(format!("negative offset {}", offset)))?
            };
            file.write(offset, data).await
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        match self.inode(ino).and_then(|inode| {
            inode.as_directory()?;
            Ok(inode)
        }) {
            Ok(inode) => reply.opened(self.handles.open(inode, flags), 0),
            Err(e) => reply.error(errno("opendir", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);

        let handle = self.handles.get(fh);
        // Only a rewind re-reads the directory; later pages come from the
        // listing taken then
        let cached = match &handle {
            Some(handle) if offset > 0 => handle.listing(),
            _ => None,
        };

        let listing = match cached {
            Some(listing) => listing,
            None => {
                let dir = match &handle {
                    Some(handle) => handle.inode.clone(),
                    None => match self.inode(ino) {
                        Ok(inode) => inode,
                        Err(e) => {
                            reply.error(errno("readdir", &e));
                            return;
                        }
                    },
                };
                let result = self.block_on(async {
                    let dir = dir.as_directory()?;
                    list_directory(dir).await
                });
                match (result, &handle) {
                    (Ok(entries), Some(handle)) => handle.set_listing(entries),
                    (Ok(entries), None) => Arc::new(entries),
                    (Err(e), _) => {
                        reply.error(errno("readdir", &e));
                        return;
                    }
                }
            }
        };

        for (next, entry) in page(&listing, offset) {
            if reply.add(entry.ino, next, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.handles.close(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let files = self.mount.status().loaded_inodes as u64;
        reply.statfs(
            0,                     // blocks
            0,                     // bfree
            0,                     // bavail
            files,                 // files
            u64::from(u32::MAX),   // ffree
            DIR_BLOCK_SIZE as u32, // bsize
            MAX_NAME_LEN,          // namelen
            DIR_BLOCK_SIZE as u32, // frsize
        );
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let kind = if mode & 0o111 != 0 {
            EntryKind::Executable
        } else {
            EntryKind::Regular
        };
        let result = self.block_on(async {
            let dir = self.directory(parent)?;
            let child = dir.create_child(name_str(name)?, kind).await?;
            let attr = self.entry_attr(&child).await?;
            Ok::<_, Error>((child, attr))
        });
        match result {
            Ok((child, attr)) => {
                let fh = self.handles.open(child, flags);
                reply.created(&TTL, &attr, self.generation(), fh, 0);
            }
            Err(e) => reply.error(errno("create", &e)),
        }
    }
}
