//! Shadow metadata: the cached attributes of a Slow-tier file, kept as a
//! reserved sibling in the fast store so attribute queries never touch the
//! slow store.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};
use crate::path::{SHADOW_PREFIX, sibling_with_prefix};
use crate::storage::Storage;

pub const SHADOW_VERSION: u32 = 1;
/// Encoded size of a [`ShadowMetadata`] record.
pub const SHADOW_RECORD_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowTime {
    pub secs: i64,
    pub nanos: u32,
}

impl ShadowTime {
    pub fn to_system_time(self) -> SystemTime {
        let nanos = Duration::from_nanos(u64::from(self.nanos));
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.secs as u64) + nanos
        } else {
            UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs()) + nanos
        }
    }
}

/// Fixed-schema, versioned attribute record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowMetadata {
    pub version: u32,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: ShadowTime,
    pub mtime: ShadowTime,
    pub ctime: ShadowTime,
    pub nlink: u32,
}

impl ShadowMetadata {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            version: SHADOW_VERSION,
            mode: meta.mode(),
            size: meta.size(),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: ShadowTime {
                secs: meta.atime(),
                nanos: meta.atime_nsec() as u32,
            },
            mtime: ShadowTime {
                secs: meta.mtime(),
                nanos: meta.mtime_nsec() as u32,
            },
            ctime: ShadowTime {
                secs: meta.ctime(),
                nanos: meta.ctime_nsec() as u32,
            },
            nlink: meta.nlink() as u32,
        }
    }

    pub fn encode(&self, at: &Path) -> Result<Vec<u8>> {
        // Fixed-width little-endian layout; every field is plain data.
        let bytes = bincode::serialize(self).map_err(|e| TierError::Corrupt {
            path: at.to_path_buf(),
            reason: e.to_string(),
        })?;
        if bytes.len() != SHADOW_RECORD_LEN {
            return Err(TierError::Corrupt {
                path: at.to_path_buf(),
                reason: format!("encoded {} bytes, expected {SHADOW_RECORD_LEN}", bytes.len()),
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], at: &Path) -> Result<Self> {
        let corrupt = |reason: String| TierError::Corrupt {
            path: at.to_path_buf(),
            reason,
        };
        if bytes.len() != SHADOW_RECORD_LEN {
            return Err(corrupt(format!(
                "record is {} bytes, expected {SHADOW_RECORD_LEN}",
                bytes.len()
            )));
        }
        let meta: ShadowMetadata =
            bincode::deserialize(bytes).map_err(|e| corrupt(e.to_string()))?;
        if meta.version != SHADOW_VERSION {
            return Err(corrupt(format!("unsupported version {}", meta.version)));
        }
        if meta.mode & libc::S_IFMT != libc::S_IFREG {
            return Err(corrupt(format!("mode {:o} is not a regular file", meta.mode)));
        }
        Ok(meta)
    }
}

/// Path of the shadow artifact belonging to the fast-store path `fast`.
pub fn shadow_path(fast: &Path) -> Result<PathBuf> {
    sibling_with_prefix(fast, SHADOW_PREFIX)
}

pub struct ShadowStore<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> ShadowStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn exists(&self, fast: &Path) -> Result<bool> {
        let shadow = shadow_path(fast)?;
        match self.storage.symlink_metadata(&shadow).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TierError::from_io(e, shadow.display())),
        }
    }

    pub async fn load(&self, fast: &Path) -> Result<ShadowMetadata> {
        let shadow = shadow_path(fast)?;
        let bytes = self
            .storage
            .read_prefix(&shadow, SHADOW_RECORD_LEN + 1)
            .await
            .map_err(|e| TierError::from_io(e, shadow.display()))?;
        ShadowMetadata::decode(&bytes, &shadow)
    }

    pub async fn save(&self, fast: &Path, meta: &ShadowMetadata) -> Result<()> {
        let shadow = shadow_path(fast)?;
        let bytes = meta.encode(&shadow)?;
        self.storage
            .write_atomic(&shadow, &bytes)
            .await
            .map_err(|e| TierError::from_io(e, shadow.display()))
    }

    /// Snapshot the slow-store file and save it as the shadow of `fast`.
    pub async fn refresh(&self, fast: &Path, slow: &Path) -> Result<ShadowMetadata> {
        let meta = self
            .storage
            .metadata(slow)
            .await
            .map_err(|e| TierError::from_io(e, slow.display()))?;
        let shadow = ShadowMetadata::from_metadata(&meta);
        self.save(fast, &shadow).await?;
        Ok(shadow)
    }

    pub async fn delete(&self, fast: &Path) -> Result<()> {
        let shadow = shadow_path(fast)?;
        self.storage
            .remove_file(&shadow)
            .await
            .map_err(|e| TierError::from_io(e, shadow.display()))
    }

    /// Move the shadow of `from` so it shadows `to`.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let src = shadow_path(from)?;
        let dst = shadow_path(to)?;
        self.storage
            .rename(&src, &dst)
            .await
            .map_err(|e| TierError::from_io(e, src.display()))
    }
}
