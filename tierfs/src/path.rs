//! Virtual paths and the reserved artifact namespace in the fast store.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TierError};

/// Every basename with this prefix belongs to the tiering bookkeeping.
pub const RESERVED_PREFIX: &str = ".tier~";
/// Shadow metadata sibling: `<dir>/.tier~meta~<name>`.
pub const SHADOW_PREFIX: &str = ".tier~meta~";
/// Temporary sibling used for atomic replacement: `<dir>/.tier~tmp~<name>`.
pub const TEMP_PREFIX: &str = ".tier~tmp~";

const NAME_MAX: usize = libc::NAME_MAX as usize;
const PATH_MAX: usize = libc::PATH_MAX as usize;

pub fn is_reserved_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(RESERVED_PREFIX.as_bytes())
}

pub fn is_temp_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(TEMP_PREFIX.as_bytes())
}

fn prefixed(prefix: &str, name: &OsStr) -> OsString {
    let mut bytes = Vec::with_capacity(prefix.len() + name.len());
    bytes.extend_from_slice(prefix.as_bytes());
    bytes.extend_from_slice(name.as_bytes());
    OsString::from_vec(bytes)
}

/// Sibling of `physical` carrying `prefix` in front of its basename.
pub fn sibling_with_prefix(physical: &Path, prefix: &str) -> Result<PathBuf> {
    let name = physical
        .file_name()
        .ok_or_else(|| TierError::InvalidPath(physical.display().to_string()))?;
    let sibling = prefixed(prefix, name);
    // The prefixed sibling may overflow NAME_MAX even when the original fits.
    if sibling.len() > NAME_MAX {
        return Err(TierError::NameTooLong(physical.display().to_string()));
    }
    Ok(physical.with_file_name(sibling))
}

/// Name of the artifact that holds the shadow metadata for `name`.
pub fn shadow_name(name: &OsStr) -> OsString {
    prefixed(SHADOW_PREFIX, name)
}

/// Strip the shadow prefix, returning the virtual basename it shadows.
pub fn shadowed_name(artifact: &OsStr) -> Option<&OsStr> {
    artifact
        .as_bytes()
        .strip_prefix(SHADOW_PREFIX.as_bytes())
        .map(OsStr::from_bytes)
}

/// Slash-separated logical path below the mount root.
///
/// Always absolute, normalized (no `.`/`..`, no empty components) and free of
/// reserved basenames.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(PathBuf);

impl VirtualPath {
    pub fn root() -> Self {
        VirtualPath(PathBuf::from("/"))
    }

    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().as_bytes().contains(&0) {
            return Err(TierError::InvalidPath(path.display().to_string()));
        }
        let mut out = PathBuf::from("/");
        let mut components = path.components();
        match components.next() {
            Some(Component::RootDir) => {}
            _ => return Err(TierError::InvalidPath(path.display().to_string())),
        }
        for component in components {
            match component {
                Component::Normal(name) => {
                    check_name(name)?;
                    out.push(name);
                }
                Component::CurDir => {}
                _ => return Err(TierError::InvalidPath(path.display().to_string())),
            }
        }
        if out.as_os_str().len() > PATH_MAX {
            return Err(TierError::NameTooLong(path.display().to_string()));
        }
        Ok(VirtualPath(out))
    }

    /// Child of this directory path.
    pub fn join(&self, name: &OsStr) -> Result<Self> {
        check_name(name)?;
        let joined = self.0.join(name);
        if joined.as_os_str().len() > PATH_MAX {
            return Err(TierError::NameTooLong(joined.display().to_string()));
        }
        Ok(VirtualPath(joined))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str() == "/"
    }

    pub fn parent(&self) -> Option<VirtualPath> {
        self.0.parent().map(|p| VirtualPath(p.to_path_buf()))
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Path relative to a store root.
    pub fn relative(&self) -> &Path {
        self.0.strip_prefix("/").unwrap_or(&self.0)
    }

    pub fn starts_with(&self, base: &VirtualPath) -> bool {
        self.0.starts_with(&base.0)
    }

    /// Re-parent a descendant of `from` below `to`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        let rest = self.0.strip_prefix(&from.0).ok()?;
        if rest.as_os_str().is_empty() {
            return Some(to.clone());
        }
        Some(VirtualPath(to.0.join(rest)))
    }

    /// Physical location of this path below `root`, length checked.
    pub fn under(&self, root: &Path) -> Result<PathBuf> {
        let physical = if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(self.relative())
        };
        if physical.as_os_str().len() > PATH_MAX {
            return Err(TierError::NameTooLong(physical.display().to_string()));
        }
        Ok(physical)
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn check_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(TierError::InvalidPath(name.to_string_lossy().into_owned()));
    }
    if bytes.contains(&0) {
        return Err(TierError::InvalidPath(name.to_string_lossy().into_owned()));
    }
    if bytes.len() > NAME_MAX {
        return Err(TierError::NameTooLong(name.to_string_lossy().into_owned()));
    }
    if is_reserved_name(name) {
        return Err(TierError::ReservedName(name.to_string_lossy().into_owned()));
    }
    Ok(())
}
