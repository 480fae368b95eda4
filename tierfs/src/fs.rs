//! Path-based operation handlers.
//!
//! Each handler resolves the virtual path, branches on the tier and works on
//! the physical file. Slow-tier attributes come from the shadow metadata; the
//! slow store is only touched for data and for attribute changes.

use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use nix::sys::stat::{Mode, SFlag, UtimensatFlags, utimensat};
use nix::sys::statvfs::statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::TierConfig;
use crate::error::{Result, TierError};
use crate::path::{VirtualPath, is_reserved_name, is_temp_name};
use crate::storage::{LocalStorage, Storage};
use crate::tier::shadow::{ShadowMetadata, ShadowTime};
use crate::tier::{Location, MigrationEngine, PathLocks, Resolver, ShadowStore, Tier};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_fifo() {
            EntryKind::NamedPipe
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::RegularFile
        }
    }
}

/// Attributes as reported to clients, whatever the tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attr {
    /// Inode of the fast-store entry.
    pub ino: u64,
    pub kind: EntryKind,
    pub perm: u16,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            kind: meta.file_type().into(),
            perm: (meta.mode() & 0o7777) as u16,
            size: meta.size(),
            blocks: meta.blocks(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            atime: time_of(meta.atime(), meta.atime_nsec()),
            mtime: time_of(meta.mtime(), meta.mtime_nsec()),
            ctime: time_of(meta.ctime(), meta.ctime_nsec()),
        }
    }

    fn from_shadow(shadow: &ShadowMetadata, record: &Metadata) -> Self {
        Self {
            ino: record.ino(),
            kind: EntryKind::RegularFile,
            perm: (shadow.mode & 0o7777) as u16,
            size: shadow.size,
            blocks: shadow.size.div_ceil(512),
            nlink: shadow.nlink,
            uid: shadow.uid,
            gid: shadow.gid,
            rdev: 0,
            blksize: record.blksize() as u32,
            atime: shadow.atime.to_system_time(),
            mtime: shadow.mtime.to_system_time(),
            ctime: shadow.ctime.to_system_time(),
        }
    }
}

fn time_of(secs: i64, nsec: i64) -> SystemTime {
    ShadowTime {
        secs,
        nanos: nsec as u32,
    }
    .to_system_time()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
    pub ino: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// The tiering filesystem.
pub struct TierFs<S: Storage = LocalStorage> {
    config: Arc<TierConfig>,
    shadows: Arc<ShadowStore<S>>,
    resolver: Resolver<S>,
    migrator: MigrationEngine<S>,
    locks: PathLocks,
}

impl TierFs<LocalStorage> {
    pub fn new(config: TierConfig) -> Self {
        Self::with_storage(config, LocalStorage)
    }
}

impl<S: Storage> TierFs<S> {
    pub fn with_storage(config: TierConfig, storage: S) -> Self {
        let config = Arc::new(config);
        let storage = Arc::new(storage);
        let shadows = Arc::new(ShadowStore::new(storage.clone()));
        let resolver = Resolver::new(config.clone(), storage.clone(), shadows.clone());
        let migrator = MigrationEngine::new(config.clone(), storage, shadows.clone());
        Self {
            config,
            shadows,
            resolver,
            migrator,
            locks: PathLocks::new(),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Current tier and physical location of `path`.
    pub async fn locate(&self, path: &VirtualPath) -> Result<Location> {
        let _guard = self.locks.shared(path).await;
        self.resolver.resolve(path).await
    }

    pub async fn getattr(&self, path: &VirtualPath) -> Result<Attr> {
        let _guard = self.locks.shared(path).await;
        self.attr_of(path).await
    }

    async fn attr_of(&self, path: &VirtualPath) -> Result<Attr> {
        let loc = self.resolver.resolve(path).await?;
        debug!("getattr {path} -> {:?} {}", loc.tier, loc.physical.display());
        match loc.tier {
            Tier::Fast => Ok(Attr::from_metadata(&loc.fast_meta)),
            Tier::Slow => {
                let shadow = self.shadows.load(&loc.fast).await?;
                Ok(Attr::from_shadow(&shadow, &loc.fast_meta))
            }
        }
    }

    /// Entries of a directory, without `.`/`..` and without tier artifacts.
    pub async fn readdir(&self, path: &VirtualPath) -> Result<Vec<DirEntry>> {
        let _guard = self.locks.shared(path).await;
        let dir = self.resolver.fast_path(path)?;
        let mut rd = fs::read_dir(&dir)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| TierError::from_io(e, path))?
        {
            let name = entry.file_name();
            if is_reserved_name(&name) {
                continue;
            }
            // Indirection records are regular files, so Slow-tier entries
            // already report as such.
            let kind = match entry.file_type().await {
                Ok(ft) => ft.into(),
                Err(e) => {
                    warn!("readdir {path}: skipping {name:?}: {e}");
                    continue;
                }
            };
            entries.push(DirEntry {
                name,
                kind,
                ino: entry.ino(),
            });
        }
        debug!("readdir {path}: {} entries", entries.len());
        Ok(entries)
    }

    pub async fn access(&self, path: &VirtualPath, mask: i32) -> Result<()> {
        let _guard = self.locks.shared(path).await;
        let loc = self.resolver.resolve(path).await?;
        debug!("access {path} mask {mask:o} -> {}", loc.physical.display());
        nix::unistd::access(&loc.physical, AccessFlags::from_bits_truncate(mask))
            .map_err(|e| TierError::from_io(e.into(), path))
    }

    /// Target of a user-created symbolic link, exactly as it was stored.
    pub async fn readlink(&self, path: &VirtualPath) -> Result<PathBuf> {
        let _guard = self.locks.shared(path).await;
        let loc = self.resolver.resolve(path).await?;
        if !loc.fast_meta.file_type().is_symlink() {
            return Err(TierError::InvalidPath(path.to_string()));
        }
        fs::read_link(&loc.fast)
            .await
            .map_err(|e| TierError::from_io(e, path))
    }

    /// Create a symbolic link holding `target` verbatim.
    pub async fn symlink(&self, target: &Path, link: &VirtualPath) -> Result<Attr> {
        let _guard = self.locks.exclusive(link).await;
        let fast = self.resolver.fast_path(link)?;
        debug!("symlink {link} -> {}", target.display());
        fs::symlink(target, &fast)
            .await
            .map_err(|e| TierError::from_io(e, link))?;
        self.attr_of(link).await
    }

    pub async fn unlink(&self, path: &VirtualPath) -> Result<()> {
        let _guard = self.locks.exclusive(path).await;
        let loc = self.resolver.resolve(path).await?;
        debug!("unlink {path} ({:?})", loc.tier);
        match loc.tier {
            Tier::Slow => self.migrator.retire(path, &loc).await,
            Tier::Fast if loc.fast_meta.is_dir() => Err(TierError::IsADirectory(path.to_string())),
            Tier::Fast => fs::remove_file(&loc.fast)
                .await
                .map_err(|e| TierError::from_io(e, path)),
        }
    }

    /// Create a regular file in the fast store. An existing file is opened
    /// instead unless `O_EXCL` is set.
    pub async fn create(&self, path: &VirtualPath, mode: u32, flags: u32) -> Result<Attr> {
        let flags = flags as i32;
        {
            let _guard = self.locks.exclusive(path).await;
            let fast = self.resolver.fast_path(path)?;
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&fast)
                .await;
            match created {
                Ok(_) => {
                    debug!("create {path} mode {mode:o}");
                    return self.attr_of(path).await;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && flags & libc::O_EXCL == 0 => {}
                Err(e) => return Err(TierError::from_io(e, path)),
            }
        }
        if flags & libc::O_TRUNC != 0 {
            self.truncate(path, 0).await?;
        }
        self.open(path, flags as u32).await?;
        self.getattr(path).await
    }

    /// Create a device node, FIFO or regular file in the fast store.
    pub async fn mknod(&self, path: &VirtualPath, mode: u32, rdev: u32) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let fast = self.resolver.fast_path(path)?;
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
        let fmt = mode & libc::S_IFMT;
        debug!("mknod {path} mode {mode:o} rdev {rdev}");
        match fmt {
            0 | libc::S_IFREG => {
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode & 0o7777)
                    .open(&fast)
                    .await
                    .map_err(|e| TierError::from_io(e, path))?;
            }
            libc::S_IFIFO => {
                nix::unistd::mkfifo(&fast, perm).map_err(|e| TierError::from_io(e.into(), path))?
            }
            _ => nix::sys::stat::mknod(
                &fast,
                SFlag::from_bits_truncate(fmt as libc::mode_t),
                perm,
                rdev as libc::dev_t,
            )
            .map_err(|e| TierError::from_io(e.into(), path))?,
        }
        self.attr_of(path).await
    }

    pub async fn mkdir(&self, path: &VirtualPath, mode: u32) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let fast = self.resolver.fast_path(path)?;
        debug!("mkdir {path} mode {mode:o}");
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&fast)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        self.attr_of(path).await
    }

    pub async fn rmdir(&self, path: &VirtualPath) -> Result<()> {
        if path.is_root() {
            return Err(TierError::PermissionDenied(path.to_string()));
        }
        let _guard = self.locks.exclusive(path).await;
        let fast = self.resolver.fast_path(path)?;
        debug!("rmdir {path}");
        match fs::remove_dir(&fast).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                // Leftovers of interrupted atomic writes may be all that is left.
                if self.purge_temps(&fast).await? == 0 {
                    return Err(TierError::NotEmpty(path.to_string()));
                }
                fs::remove_dir(&fast)
                    .await
                    .map_err(|e| TierError::from_io(e, path))
            }
            Err(e) => Err(TierError::from_io(e, path)),
        }
    }

    async fn purge_temps(&self, dir: &Path) -> Result<usize> {
        let mut rd = fs::read_dir(dir).await?;
        let mut removed = 0;
        while let Some(entry) = rd.next_entry().await? {
            if is_temp_name(&entry.file_name()) {
                warn!("removing stale temporary {}", entry.path().display());
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Rename within the virtual namespace. Slow-tier bytes never move.
    pub async fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<()> {
        if from.is_root() || to.is_root() {
            return Err(TierError::InvalidPath(from.to_string()));
        }
        let _guards = self.locks.exclusive_pair(from, to).await;
        let src = self.resolver.resolve(from).await?;
        if from == to {
            return Ok(());
        }
        let to_fast = self.resolver.fast_path(to)?;
        let dst = match self.resolver.resolve(to).await {
            Ok(loc) => Some(loc),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(dst) = &dst {
            match (src.fast_meta.is_dir(), dst.fast_meta.is_dir()) {
                (true, false) => return Err(TierError::NotADirectory(to.to_string())),
                (false, true) => return Err(TierError::IsADirectory(to.to_string())),
                _ => {}
            }
            if dst.is_slow() {
                self.migrator.retire(to, dst).await?;
            }
        }
        debug!("rename {from} -> {to} ({:?})", src.tier);
        match src.tier {
            Tier::Slow => self.migrator.relocate(from, &src, &to_fast).await,
            Tier::Fast => fs::rename(&src.fast, &to_fast)
                .await
                .map_err(|e| TierError::from_io(e, from)),
        }
    }

    pub async fn chmod(&self, path: &VirtualPath, mode: u32) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let loc = self.resolver.resolve(path).await?;
        debug!("chmod {path} {mode:o} -> {}", loc.physical.display());
        fs::set_permissions(&loc.physical, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        self.settle_attrs(path, &loc).await
    }

    pub async fn chown(&self, path: &VirtualPath, uid: Option<u32>, gid: Option<u32>) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let loc = self.resolver.resolve(path).await?;
        debug!("chown {path} {uid:?}:{gid:?} -> {}", loc.physical.display());
        let changed = match loc.tier {
            Tier::Slow => std::os::unix::fs::chown(&loc.physical, uid, gid),
            Tier::Fast => std::os::unix::fs::lchown(&loc.physical, uid, gid),
        };
        changed.map_err(|e| TierError::from_io(e, path))?;
        self.settle_attrs(path, &loc).await
    }

    /// `None` leaves the corresponding timestamp untouched.
    pub async fn utimens(
        &self,
        path: &VirtualPath,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let loc = self.resolver.resolve(path).await?;
        debug!("utimens {path} -> {}", loc.physical.display());
        let stamp = |t: Option<SystemTime>| match t {
            Some(t) => TimeSpec::from(t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default()),
            None => TimeSpec::UTIME_OMIT,
        };
        utimensat(
            None,
            &loc.physical,
            &stamp(atime),
            &stamp(mtime),
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(|e| TierError::from_io(e.into(), path))?;
        self.settle_attrs(path, &loc).await
    }

    /// Refresh the shadow after an attribute change and report the result.
    async fn settle_attrs(&self, path: &VirtualPath, loc: &Location) -> Result<Attr> {
        if loc.is_slow() {
            self.shadows.refresh(&loc.fast, &loc.physical).await?;
        }
        self.attr_of(path).await
    }

    /// Change the size of a file, migrating it when the threshold is crossed.
    pub async fn truncate(&self, path: &VirtualPath, size: u64) -> Result<Attr> {
        let _guard = self.locks.exclusive(path).await;
        let loc = self.resolve_file(path).await?;
        let slow_wanted = self.config.policy.belongs_in_slow(size);
        debug!("truncate {path} to {size} ({:?})", loc.tier);
        match (loc.tier, slow_wanted) {
            (Tier::Fast, false) => {
                set_len(&loc.physical, size).await.map_err(|e| TierError::from_io(e, path))?;
            }
            (Tier::Fast, true) => {
                // Promote at the old size; a failed move leaves the file untouched.
                let loc = self.migrator.promote(path, &loc).await?;
                set_len(&loc.physical, size).await.map_err(|e| TierError::from_io(e, path))?;
                self.shadows.refresh(&loc.fast, &loc.physical).await?;
            }
            (Tier::Slow, false) => {
                let loc = self.migrator.demote(path, &loc).await?;
                set_len(&loc.physical, size).await.map_err(|e| TierError::from_io(e, path))?;
            }
            (Tier::Slow, true) => {
                set_len(&loc.physical, size).await.map_err(|e| TierError::from_io(e, path))?;
                self.shadows.refresh(&loc.fast, &loc.physical).await?;
            }
        }
        self.attr_of(path).await
    }

    /// Check that the file can be opened with `flags`. No handle is kept:
    /// every read and write reopens the physical file by path.
    pub async fn open(&self, path: &VirtualPath, flags: u32) -> Result<()> {
        let _guard = self.locks.shared(path).await;
        let loc = self.resolver.resolve(path).await?;
        if loc.fast_meta.is_dir() {
            return Err(TierError::IsADirectory(path.to_string()));
        }
        let flags = flags as i32;
        let accmode = flags & libc::O_ACCMODE;
        let passthrough = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC);
        debug!("open {path} flags {flags:#x} -> {}", loc.physical.display());
        fs::OpenOptions::new()
            .read(accmode != libc::O_WRONLY)
            .write(accmode != libc::O_RDONLY)
            .custom_flags(passthrough & !libc::O_APPEND)
            .open(&loc.physical)
            .await
            .map(drop)
            .map_err(|e| TierError::from_io(e, path))
    }

    /// Read up to `size` bytes at `offset`; short only at end of file.
    pub async fn read(&self, path: &VirtualPath, offset: u64, size: u32) -> Result<Bytes> {
        let _guard = self.locks.shared(path).await;
        let loc = self.resolve_file(path).await?;
        debug!("read {path} {size}@{offset} -> {}", loc.physical.display());
        read_at(&loc.physical, offset, size as usize)
            .await
            .map(Bytes::from)
            .map_err(|e| TierError::from_io(e, path))
    }

    /// Write `data` at `offset`. A write that makes a Fast-tier file reach the
    /// threshold promotes it first, so the bytes land in the slow store.
    pub async fn write(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<u32> {
        let end = offset.saturating_add(data.len() as u64);
        let shared = self.locks.shared(path).await;
        let loc = self.resolve_file(path).await?;
        if data.is_empty() {
            // Nothing lands, so neither the size nor the tier may change.
            return Ok(0);
        }
        if !loc.is_slow() && self.config.policy.belongs_in_slow(loc.fast_meta.len().max(end)) {
            drop(shared);
            return self.write_promoting(path, offset, data).await;
        }

        debug!("write {path} {}@{offset} -> {}", data.len(), loc.physical.display());
        let new_len = write_at(&loc.physical, offset, data)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        drop(shared);

        // Concurrent writers may have pushed a Fast-tier file over the edge.
        if loc.is_slow() || self.config.policy.belongs_in_slow(new_len) {
            self.settle_after_write(path).await?;
        }
        Ok(data.len() as u32)
    }

    async fn write_promoting(&self, path: &VirtualPath, offset: u64, data: &[u8]) -> Result<u32> {
        let _guard = self.locks.exclusive(path).await;
        let mut loc = self.resolve_file(path).await?;
        if !loc.is_slow() {
            loc = self.migrator.promote(path, &loc).await?;
        }
        debug!("write {path} {}@{offset} -> {}", data.len(), loc.physical.display());
        write_at(&loc.physical, offset, data)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        self.shadows.refresh(&loc.fast, &loc.physical).await?;
        Ok(data.len() as u32)
    }

    async fn settle_after_write(&self, path: &VirtualPath) -> Result<()> {
        let _guard = self.locks.exclusive(path).await;
        let loc = match self.resolver.resolve(path).await {
            Ok(loc) => loc,
            // Unlinked or renamed away since the data went in.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        match loc.tier {
            Tier::Slow => {
                self.shadows.refresh(&loc.fast, &loc.physical).await?;
            }
            Tier::Fast
                if loc.fast_meta.is_file()
                    && self.config.policy.belongs_in_slow(loc.fast_meta.len()) =>
            {
                self.migrator.promote(path, &loc).await?;
            }
            Tier::Fast => {}
        }
        Ok(())
    }

    /// Combined capacity of both stores.
    pub async fn statfs(&self) -> Result<StatFs> {
        let fast = statvfs(&self.config.fast_root)?;
        let slow = statvfs(&self.config.slow_root)?;
        let frsize = (fast.fragment_size() as u64).max(1);
        let slow_frsize = (slow.fragment_size() as u64).max(1);
        // Slow-store blocks expressed in fast-store fragments.
        let scale = |blocks: u64| blocks.saturating_mul(slow_frsize) / frsize;
        Ok(StatFs {
            blocks: fast.blocks() as u64 + scale(slow.blocks() as u64),
            bfree: fast.blocks_free() as u64 + scale(slow.blocks_free() as u64),
            bavail: fast.blocks_available() as u64 + scale(slow.blocks_available() as u64),
            files: fast.files() as u64,
            ffree: fast.files_free() as u64,
            bsize: fast.block_size() as u32,
            namelen: fast.name_max() as u32,
            frsize: frsize as u32,
        })
    }

    async fn resolve_file(&self, path: &VirtualPath) -> Result<Location> {
        let loc = self.resolver.resolve(path).await?;
        if loc.fast_meta.is_dir() {
            return Err(TierError::IsADirectory(path.to_string()));
        }
        Ok(loc)
    }
}

async fn set_len(path: &Path, size: u64) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(size).await
}

async fn read_at(path: &Path, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(size.min(1 << 20));
    file.take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Write at `offset` and return the file length afterwards.
async fn write_at(path: &Path, offset: u64, data: &[u8]) -> io::Result<u64> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(file.metadata().await?.len())
}
