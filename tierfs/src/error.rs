//! Error surface of the tiering core.
//!
//! Storage errors are folded into the nearest kind; anything without a
//! dedicated kind stays an `Io` error so its raw errno reaches the kernel
//! unchanged.

use std::io::{self, ErrorKind};
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TierError>;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("i/o error: {0}")]
    Io(#[source] io::Error),

    /// The indirection record and the shadow metadata of a path disagree.
    #[error("inconsistent tier state at {path}: {reason}")]
    InconsistentState { path: String, reason: String },

    #[error("corrupt shadow metadata at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("cross-tier move {} -> {} failed: {source}", from.display(), to.display())]
    CrossTierMoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid virtual path: {0}")]
    InvalidPath(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("reserved name: {0}")]
    ReservedName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TierError {
    pub fn inconsistent(path: impl ToString, reason: impl Into<String>) -> Self {
        TierError::InconsistentState {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach a path hint to a raw storage error while classifying it.
    pub fn from_io(err: io::Error, path: impl ToString) -> Self {
        let path = path.to_string();
        match err.raw_os_error() {
            Some(libc::ENOENT) => return TierError::NotFound(path),
            Some(libc::EEXIST) => return TierError::AlreadyExists(path),
            Some(libc::ENOTEMPTY) => return TierError::NotEmpty(path),
            Some(libc::EACCES) => return TierError::PermissionDenied(path),
            Some(libc::ENOTDIR) => return TierError::NotADirectory(path),
            Some(libc::EISDIR) => return TierError::IsADirectory(path),
            Some(libc::ENAMETOOLONG) => return TierError::NameTooLong(path),
            _ => {}
        }
        match err.kind() {
            ErrorKind::NotFound => TierError::NotFound(path),
            ErrorKind::AlreadyExists => TierError::AlreadyExists(path),
            _ => TierError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TierError::NotFound(_))
    }

    /// Stable errno reported to the dispatcher.
    pub fn errno(&self) -> libc::c_int {
        match self {
            TierError::NotFound(_) => libc::ENOENT,
            TierError::PermissionDenied(_) => libc::EACCES,
            TierError::AlreadyExists(_) => libc::EEXIST,
            TierError::NotEmpty(_) => libc::ENOTEMPTY,
            TierError::NotADirectory(_) => libc::ENOTDIR,
            TierError::IsADirectory(_) => libc::EISDIR,
            TierError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            TierError::InconsistentState { .. } => libc::EUCLEAN,
            TierError::Corrupt { .. } => libc::EBADMSG,
            TierError::CrossTierMoveFailed { .. } => libc::EIO,
            TierError::InvalidPath(_) => libc::EINVAL,
            TierError::NameTooLong(_) => libc::ENAMETOOLONG,
            TierError::ReservedName(_) => libc::EPERM,
            TierError::InvalidConfig(_) => libc::EINVAL,
        }
    }
}

impl From<io::Error> for TierError {
    fn from(err: io::Error) -> Self {
        TierError::from_io(err, "")
    }
}

impl From<nix::errno::Errno> for TierError {
    fn from(errno: nix::errno::Errno) -> Self {
        TierError::from(io::Error::from(errno))
    }
}

impl From<TierError> for rfuse3::Errno {
    fn from(err: TierError) -> Self {
        rfuse3::Errno::from(err.errno())
    }
}
