//! FUSE adapter: exposes the namespace through the fuse3 raw API.
//!
//! The adapter is deliberately thin. It resolves inodes against the
//! namespace, tracks open handles, and registers one interrupt token per
//! in-flight request so the kernel's INTERRUPT opcode can cancel a stuck
//! read (a blocked stream read, a chunk-lock wait, or a network transfer).

pub mod mount;

use crate::fs::{FileNode, Namespace, Node, NodeKind, OpenFile, ROOT_INO};
use crate::util::cancel::Interrupt;
use bytes::Bytes;
use dashmap::DashMap;
use fuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use fuse3::raw::{Filesystem, Request};
use fuse3::{FileType, Result as FuseResult, SetAttr, Timestamp};
use futures_util::stream::{self, BoxStream};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// fuse_file_info.flags bits for open replies (linux/fuse.h).
const FOPEN_DIRECT_IO: u32 = 1 << 0;
const FOPEN_NONSEEKABLE: u32 = 1 << 2;

const TTL: Duration = Duration::from_secs(1);

pub struct VmnetFuse {
    ns: Arc<Namespace>,
    handles: DashMap<u64, Arc<OpenFile>>,
    next_fh: AtomicU64,
    interrupts: DashMap<u64, Interrupt>,
}

impl VmnetFuse {
    pub fn new(ns: Arc<Namespace>) -> Self {
        Self {
            ns,
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            interrupts: DashMap::new(),
        }
    }

    fn node(&self, ino: u64) -> FuseResult<&Node> {
        self.ns.node(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn handle(&self, fh: u64) -> FuseResult<Arc<OpenFile>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| libc::EBADF.into())
    }

    /// Register an interrupt token for the duration of one request.
    fn track_request(&self, unique: u64) -> RequestGuard<'_> {
        let intr = Interrupt::new();
        self.interrupts.insert(unique, intr.clone());
        RequestGuard {
            fs: self,
            unique,
            intr,
        }
    }

    fn attr_of(&self, node: &Node, req: &Request) -> FileAttr {
        let now = Timestamp::from(SystemTime::now());
        let (kind, nlink) = match &node.kind {
            NodeKind::Dir(_) => (FileType::Directory, 2),
            NodeKind::File(_) => (FileType::RegularFile, 1),
        };
        let size = node.size();
        FileAttr {
            ino: node.ino,
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            #[cfg(target_os = "macos")]
            crtime: now,
            kind,
            perm: node.mode(),
            nlink,
            uid: req.uid,
            gid: req.gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: 4096,
        }
    }
}

struct RequestGuard<'a> {
    fs: &'a VmnetFuse,
    unique: u64,
    intr: Interrupt,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.fs.interrupts.remove(&self.unique);
    }
}

#[allow(refining_impl_trait_reachable)]
impl Filesystem for VmnetFuse {
    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let name = name.to_string_lossy();
        let node = self
            .ns
            .lookup(parent, name.as_ref())
            .ok_or_else(|| fuse3::Errno::from(libc::ENOENT))?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_of(node, &req),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let node = self.node(ino)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(node, &req),
        })
    }

    // Only size changes are meaningful here: truncate on the image file.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        if let Some(size) = set_attr.size {
            let node = self.node(ino)?;
            let NodeKind::File(FileNode::Image(image)) = &node.kind else {
                return Err(libc::EACCES.into());
            };
            let image = image.clone();
            let guard = self.track_request(req.unique);
            image.truncate(size, &guard.intr).await.map_err(|e| {
                fuse3::Errno::from(match e.errno() {
                    0 => libc::EIO,
                    errno => errno,
                })
            })?;
        }
        let node = self.node(ino)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(node, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let node = self.node(ino)?;
        let NodeKind::File(file) = &node.kind else {
            return Err(libc::EISDIR.into());
        };
        let blocking = flags & libc::O_NONBLOCK as u32 == 0;
        let handle = file.open(blocking);

        let mut reply_flags = 0;
        if handle.direct_io() {
            reply_flags |= FOPEN_DIRECT_IO;
        }
        if handle.nonseekable() {
            reply_flags |= FOPEN_NONSEEKABLE;
        }

        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, Arc::new(handle));
        Ok(ReplyOpen {
            fh,
            flags: reply_flags,
        })
    }

    async fn read(
        &self,
        req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let handle = self.handle(fh)?;
        let guard = self.track_request(req.unique);
        let data = handle
            .read(offset, size as usize, &guard.intr)
            .await
            .map_err(fuse3::Errno::from)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let handle = self.handle(fh)?;
        let guard = self.track_request(req.unique);
        let written = handle
            .write(offset, data, &guard.intr)
            .await
            .map_err(fuse3::Errno::from)?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.handles.remove(&fh);
        Ok(())
    }

    async fn flush(&self, _req: Request, _ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let node = self.node(ino)?;
        if !matches!(node.kind, NodeKind::Dir(_)) {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    type DirEntryStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntry>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let node = self.node(ino)?;
        if !matches!(node.kind, NodeKind::Dir(_)) {
            return Err(libc::ENOTDIR.into());
        }

        let mut all = vec![
            DirectoryEntry {
                inode: ino,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
            },
            DirectoryEntry {
                inode: node.parent.max(ROOT_INO),
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            },
        ];
        for (i, &child) in self.ns.children(ino).iter().enumerate() {
            if let Some(child) = self.ns.node(child) {
                all.push(DirectoryEntry {
                    inode: child.ino,
                    kind: match child.kind {
                        NodeKind::Dir(_) => FileType::Directory,
                        NodeKind::File(_) => FileType::RegularFile,
                    },
                    name: OsString::from(child.name.clone()),
                    offset: i as i64 + 3,
                });
            }
        }

        let entries = all.into_iter().skip(offset as usize).map(Ok);
        let boxed: BoxStream<'a, FuseResult<DirectoryEntry>> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    type DirEntryPlusStream<'a>
        = BoxStream<'a, FuseResult<DirectoryEntryPlus>>
    where
        Self: 'a;

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let node = self.node(ino)?;
        if !matches!(node.kind, NodeKind::Dir(_)) {
            return Err(libc::ENOTDIR.into());
        }
        let parent = self.node(node.parent.max(ROOT_INO))?;

        let mut all = vec![
            DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: self.attr_of(node, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
            DirectoryEntryPlus {
                inode: parent.ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: self.attr_of(parent, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
        ];
        for (i, &child) in self.ns.children(ino).iter().enumerate() {
            if let Some(child) = self.ns.node(child) {
                all.push(DirectoryEntryPlus {
                    inode: child.ino,
                    generation: 0,
                    kind: match child.kind {
                        NodeKind::Dir(_) => FileType::Directory,
                        NodeKind::File(_) => FileType::RegularFile,
                    },
                    name: OsString::from(child.name.clone()),
                    offset: i as i64 + 3,
                    attr: self.attr_of(child, &req),
                    entry_ttl: TTL,
                    attr_ttl: TTL,
                });
            }
        }

        let entries = all.into_iter().skip(offset as usize).map(Ok);
        let boxed: BoxStream<'a, FuseResult<DirectoryEntryPlus>> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[u64]) {}

    // The kernel names the request being cancelled; wake whatever that
    // request is blocked in.
    async fn interrupt(&self, _req: Request, unique: u64) -> FuseResult<()> {
        if let Some((_, intr)) = self.interrupts.remove(&unique) {
            intr.trigger();
        }
        Ok(())
    }
}
