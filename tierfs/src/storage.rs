//! Primitive filesystem operations used by the tier bookkeeping.
//!
//! Everything that creates, moves or removes tier artifacts goes through
//! [`Storage`], so the migration protocol can be exercised against injected
//! failures.
//!
//! Indirection records are told apart from user files by an extended
//! attribute set before the record is published. Clients cannot set it
//! through the mount, so file content never decides what a file is.

use std::ffi::{CStr, CString};
use std::fs::Metadata;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use async_trait::async_trait;
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::path::{TEMP_PREFIX, sibling_with_prefix};

/// Extended attribute marking a fast-store file as an indirection record.
pub const RECORD_XATTR: &CStr = c"user.tierfs.record";
const RECORD_MARK: &[u8] = b"1";

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata>;

    async fn metadata(&self, path: &Path) -> io::Result<Metadata>;

    /// Read at most `limit` bytes from the start of `path`.
    async fn read_prefix(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>>;

    /// Replace `path` with `data` through a temporary sibling, so readers
    /// see either the old or the new content.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Like [`Storage::write_atomic`], but the published file carries the
    /// indirection record mark.
    async fn write_record(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Whether `path` carries the indirection record mark. Never reads or
    /// opens the file.
    async fn is_record(&self, path: &Path) -> io::Result<bool>;

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Move a regular file, possibly across filesystems.
    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// [`Storage`] backed by the host filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStorage;

fn temp_sibling(path: &Path) -> io::Result<std::path::PathBuf> {
    sibling_with_prefix(path, TEMP_PREFIX).map_err(|e| io::Error::from_raw_os_error(e.errno()))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::symlink_metadata(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        fs::metadata(path).await
    }

    async fn read_prefix(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>> {
        let file = fs::File::open(path).await?;
        let mut buf = Vec::with_capacity(limit.min(8192));
        file.take(limit as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        write_through_temp(path, data, false).await
    }

    async fn write_record(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        write_through_temp(path, data, true).await
    }

    async fn is_record(&self, path: &Path) -> io::Result<bool> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || has_record_mark(&path))
            .await
            .map_err(io::Error::other)?
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        match fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_across(from, to).await,
            Err(e) => Err(e),
        }
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path).await
    }
}

async fn write_through_temp(path: &Path, data: &[u8], mark: bool) -> io::Result<()> {
    let tmp = temp_sibling(path)?;
    let result = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .await?;
        file.write_all(data).await?;
        if mark {
            set_record_mark(file.as_raw_fd())?;
        }
        file.sync_all().await?;
        fs::rename(&tmp, path).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

fn set_record_mark(fd: RawFd) -> io::Result<()> {
    let res = unsafe {
        libc::fsetxattr(
            fd,
            RECORD_XATTR.as_ptr(),
            RECORD_MARK.as_ptr() as *const libc::c_void,
            RECORD_MARK.len(),
            0,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn has_record_mark(path: &Path) -> io::Result<bool> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let res = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            RECORD_XATTR.as_ptr(),
            std::ptr::null_mut(),
            0,
        )
    };
    if res >= 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // No mark, or a store that cannot hold one.
        Some(libc::ENODATA) | Some(libc::EOPNOTSUPP) => Ok(false),
        _ => Err(err),
    }
}

/// Fail early when `dir` cannot hold record marks; without them no file could
/// ever be promoted.
pub fn verify_record_marks(dir: &Path) -> io::Result<()> {
    let check = dir.join(format!("{TEMP_PREFIX}xattr~{}", uuid::Uuid::new_v4().simple()));
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&check)?;
    let marked = set_record_mark(file.as_raw_fd()).and_then(|()| has_record_mark(&check));
    drop(file);
    let _ = std::fs::remove_file(&check);
    match marked {
        Ok(true) => Ok(()),
        Ok(false) => Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
        Err(e) => Err(e),
    }
}

/// Copy `from` next to `to`, publish it with a rename, then drop the source.
async fn copy_across(from: &Path, to: &Path) -> io::Result<()> {
    let tmp = temp_sibling(to)?;
    let src_meta = fs::symlink_metadata(from).await?;
    let copied = async {
        fs::copy(from, &tmp).await?;
        fs::File::open(&tmp).await?.sync_all().await?;
        preserve_attrs(&tmp, &src_meta);
        fs::rename(&tmp, to).await
    }
    .await;
    if let Err(e) = copied {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::remove_file(from).await {
        // Leave exactly one copy behind: the original.
        let _ = fs::remove_file(to).await;
        return Err(e);
    }
    Ok(())
}

fn preserve_attrs(path: &Path, meta: &Metadata) {
    if let Err(e) = std::os::unix::fs::chown(path, Some(meta.uid()), Some(meta.gid())) {
        debug!("keep owner of {} failed: {e}", path.display());
    }
    let atime = TimeSpec::new(meta.atime(), meta.atime_nsec());
    let mtime = TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    if let Err(e) = utimensat(None, path, &atime, &mtime, UtimensatFlags::NoFollowSymlink) {
        debug!("keep timestamps of {} failed: {e}", path.display());
    }
}
