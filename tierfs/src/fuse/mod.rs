//! rfuse3 adapter.
//!
//! Translates inode-based FUSE requests into the path-based handlers of
//! [`TierFs`]. Open is stateless: every handle is 0 and reads/writes go by
//! path.

pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{Errno, FileType, SetAttr, Timestamp};

use crate::fs::{Attr, EntryKind, TierFs};
use crate::path::{VirtualPath, is_reserved_name};
use crate::storage::{LocalStorage, Storage};
use crate::tier::shadow::ShadowTime;
use inode::{InodeTable, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;

pub struct TierFuse<S: Storage = LocalStorage> {
    fs: TierFs<S>,
    inodes: InodeTable,
}

impl<S: Storage> TierFuse<S> {
    pub fn new(fs: TierFs<S>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn path(&self, ino: u64) -> FuseResult<VirtualPath> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child(&self, parent: u64, name: &OsStr) -> FuseResult<VirtualPath> {
        Ok(self.path(parent)?.join(name)?)
    }

    fn entry(&self, path: &VirtualPath, attr: &Attr) -> ReplyEntry {
        let ino = self.inodes.lookup(path);
        ReplyEntry {
            ttl: TTL,
            attr: fuse_attr(attr, ino),
            generation: 0,
        }
    }

    fn parent_ino(&self, path: &VirtualPath) -> u64 {
        path.parent()
            .and_then(|p| self.inodes.peek(&p))
            .unwrap_or(ROOT_INO)
    }
}

impl<S: Storage> Filesystem for TierFuse<S> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let cfg = self.fs.config();
        info!(
            "tierfs init: fast={} slow={} threshold={}",
            cfg.fast_root.display(),
            cfg.slow_root.display(),
            cfg.threshold()
        );
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("tierfs destroy");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        if is_reserved_name(name) {
            return Err(libc::ENOENT.into());
        }
        let path = self.child(parent, name)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(&attr, ino),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(ino)?;
        debug!("setattr {path} {set_attr:?}");
        if let Some(mode) = set_attr.mode {
            self.fs.chmod(&path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.fs.chown(&path, set_attr.uid, set_attr.gid).await?;
        }
        if let Some(size) = set_attr.size {
            self.fs.truncate(&path, size).await?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.fs
                .utimens(
                    &path,
                    set_attr.atime.map(system_time),
                    set_attr.mtime.map(system_time),
                )
                .await?;
        }
        let attr = self.fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: fuse_attr(&attr, ino),
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path(ino)?;
        let target = self.fs.readlink(&path).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_os_string().into_vec()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.fs.symlink(Path::new(link), &path).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.fs.mknod(&path, mode, rdev).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        let attr = self.fs.mkdir(&path, mode & !umask).await?;
        Ok(self.entry(&path, &attr))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.unlink(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.rmdir(&path).await?;
        self.inodes.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child(parent, name)?;
        let to = self.child(new_parent, new_name)?;
        self.fs.rename(&from, &to).await?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    // Hard links would have to span tiers.
    async fn link(
        &self,
        _req: Request,
        _ino: u64,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        Err(libc::EPERM.into())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        self.fs.open(&path, flags).await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path(ino)?;
        let data = self.fs.read(&path, offset, size).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let path = self.path(ino)?;
        let written = self.fs.write(&path, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.fs.statfs().await?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path(ino)?;
        let attr = self.fs.getattr(&path).await?;
        if attr.kind != EntryKind::Directory {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path(ino)?;
        let entries = self.fs.readdir(&path).await?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(&path),
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, e) in entries.into_iter().enumerate() {
            let inode = path
                .join(&e.name)
                .ok()
                .and_then(|child| self.inodes.peek(&child))
                .unwrap_or(e.ino);
            all.push(DirectoryEntry {
                inode,
                kind: file_type(e.kind),
                name: e.name,
                offset: i as i64 + 3,
            });
        }

        let start = offset.max(0) as usize;
        let slice: Vec<_> = all.into_iter().skip(start).collect();
        let stream: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: stream })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path(ino)?;
        let entries = self.fs.readdir(&path).await?;
        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);

        if offset < 1 {
            let attr = self.fs.getattr(&path).await?;
            all.push(plus_entry(ino, OsString::from("."), 1, &attr));
        }
        if offset < 2 {
            let parent = path.parent().unwrap_or_else(VirtualPath::root);
            if let Ok(attr) = self.fs.getattr(&parent).await {
                all.push(plus_entry(self.parent_ino(&path), OsString::from(".."), 2, &attr));
            }
        }
        // Entries past "." and ".." count as kernel lookups.
        for (i, e) in entries.into_iter().enumerate() {
            let entry_offset = i as u64 + 3;
            if entry_offset <= offset {
                continue;
            }
            let child = match path.join(&e.name) {
                Ok(child) => child,
                Err(err) => {
                    warn!("readdirplus {path}: skipping {:?}: {err}", e.name);
                    continue;
                }
            };
            let attr = match self.fs.getattr(&child).await {
                Ok(attr) => attr,
                Err(err) => {
                    warn!("readdirplus {path}: skipping {:?}: {err}", e.name);
                    continue;
                }
            };
            let child_ino = self.inodes.lookup(&child);
            all.push(plus_entry(child_ino, e.name, entry_offset as i64, &attr));
        }

        let stream: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: stream })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        let path = self.path(ino)?;
        Ok(self.fs.access(&path, mask as i32).await?)
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child(parent, name)?;
        let attr = self.fs.create(&path, mode, flags).await?;
        let ino = self.inodes.lookup(&path);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: fuse_attr(&attr, ino),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn plus_entry(ino: u64, name: OsString, offset: i64, attr: &Attr) -> DirectoryEntryPlus {
    DirectoryEntryPlus {
        inode: ino,
        generation: 0,
        kind: file_type(attr.kind),
        name,
        offset,
        attr: fuse_attr(attr, ino),
        entry_ttl: TTL,
        attr_ttl: TTL,
    }
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::RegularFile => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::NamedPipe => FileType::NamedPipe,
        EntryKind::CharDevice => FileType::CharDevice,
        EntryKind::BlockDevice => FileType::BlockDevice,
        EntryKind::Socket => FileType::Socket,
    }
}

fn fuse_attr(attr: &Attr, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: Timestamp::from(attr.atime),
        mtime: Timestamp::from(attr.mtime),
        ctime: Timestamp::from(attr.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(attr.ctime),
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: attr.blksize,
    }
}

fn system_time(ts: Timestamp) -> SystemTime {
    ShadowTime {
        secs: ts.sec,
        nanos: ts.nsec as u32,
    }
    .to_system_time()
}
