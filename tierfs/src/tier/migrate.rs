//! Promote/demote protocol.
//!
//! The engine is the only component that creates or removes indirection
//! records. Every transition moves the bytes first; the artifact writes that
//! follow get exactly one compensating action on failure, after which the
//! path is reported as `InconsistentState` and left for the repair pass.
//! Callers must hold the exclusive lock of the path.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::TierConfig;
use crate::error::{Result, TierError};
use crate::path::VirtualPath;
use crate::storage::Storage;
use crate::tier::record::IndirectionRecord;
use crate::tier::resolver::{Location, Tier};
use crate::tier::shadow::ShadowStore;

pub struct MigrationEngine<S: Storage> {
    config: Arc<TierConfig>,
    storage: Arc<S>,
    shadows: Arc<ShadowStore<S>>,
}

impl<S: Storage> MigrationEngine<S> {
    pub fn new(config: Arc<TierConfig>, storage: Arc<S>, shadows: Arc<ShadowStore<S>>) -> Self {
        Self {
            config,
            storage,
            shadows,
        }
    }

    /// Move a Fast-tier file into the slow store.
    pub async fn promote(&self, path: &VirtualPath, loc: &Location) -> Result<Location> {
        debug_assert_eq!(loc.tier, Tier::Fast);
        let fast = &loc.fast;
        let slow = self.allocate_slow(path).await?;

        self.storage
            .move_file(fast, &slow)
            .await
            .map_err(|source| TierError::CrossTierMoveFailed {
                from: fast.clone(),
                to: slow.clone(),
                source,
            })?;

        let record = IndirectionRecord::new(&slow).encode();
        if let Err(e) = self.storage.write_record(fast, &record).await {
            warn!("promote {path}: writing indirection record failed: {e}");
            return Err(self.undo_promote(path, fast, &slow, e.into()).await);
        }

        if let Err(e) = self.shadows.refresh(fast, &slow).await {
            warn!("promote {path}: saving shadow metadata failed: {e}");
            return Err(self.undo_promote(path, fast, &slow, e).await);
        }

        info!("promoted {path} -> {}", slow.display());
        self.located(path, Tier::Slow, fast, slow).await
    }

    async fn undo_promote(
        &self,
        path: &VirtualPath,
        fast: &Path,
        slow: &Path,
        cause: TierError,
    ) -> TierError {
        // Moving the bytes back replaces any record already written.
        match self.storage.move_file(slow, fast).await {
            Ok(()) => cause,
            Err(e) => {
                error!(
                    "promote {path}: rollback failed, bytes remain at {}: {e}",
                    slow.display()
                );
                TierError::inconsistent(
                    path,
                    format!("promote rollback failed ({cause}); bytes at {}", slow.display()),
                )
            }
        }
    }

    /// Move a Slow-tier file back over its indirection record.
    pub async fn demote(&self, path: &VirtualPath, loc: &Location) -> Result<Location> {
        debug_assert_eq!(loc.tier, Tier::Slow);
        let fast = &loc.fast;
        let slow = &loc.physical;

        self.storage
            .move_file(slow, fast)
            .await
            .map_err(|source| TierError::CrossTierMoveFailed {
                from: slow.clone(),
                to: fast.clone(),
                source,
            })?;

        match self.shadows.delete(fast).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("demote {path}: shadow metadata already gone");
            }
            Err(e) => {
                warn!("demote {path}: removing shadow metadata failed: {e}");
                return Err(self.undo_demote(path, fast, slow, e).await);
            }
        }

        info!("demoted {path} <- {}", slow.display());
        self.located(path, Tier::Fast, fast, fast.to_path_buf()).await
    }

    async fn undo_demote(
        &self,
        path: &VirtualPath,
        fast: &Path,
        slow: &Path,
        cause: TierError,
    ) -> TierError {
        let restored = async {
            self.storage.move_file(fast, slow).await?;
            self.storage
                .write_record(fast, &IndirectionRecord::new(slow).encode())
                .await
        }
        .await;
        match restored {
            Ok(()) => cause,
            Err(e) => {
                error!("demote {path}: rollback failed: {e}");
                TierError::inconsistent(path, format!("demote rollback failed ({cause})"))
            }
        }
    }

    /// Delete a Slow-tier file: slow bytes, then shadow, then record.
    /// Nothing removed is recreated when a later step fails.
    pub async fn retire(&self, path: &VirtualPath, loc: &Location) -> Result<()> {
        debug_assert_eq!(loc.tier, Tier::Slow);
        match self.storage.remove_file(&loc.physical).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "unlink {path}: slow-store file {} already missing",
                    loc.physical.display()
                );
            }
            Err(e) => return Err(TierError::from_io(e, loc.physical.display())),
        }
        match self.shadows.delete(&loc.fast).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.storage
            .remove_file(&loc.fast)
            .await
            .map_err(|e| TierError::from_io(e, path))
    }

    /// Rename the artifacts of a Slow-tier file; the slow-store bytes stay put.
    pub async fn relocate(&self, from: &VirtualPath, loc: &Location, to_fast: &Path) -> Result<()> {
        debug_assert_eq!(loc.tier, Tier::Slow);
        self.shadows.rename(&loc.fast, to_fast).await?;
        if let Err(e) = self.storage.rename(&loc.fast, to_fast).await {
            warn!("rename {from}: moving indirection record failed: {e}");
            let cause = TierError::from_io(e, from);
            return match self.shadows.rename(to_fast, &loc.fast).await {
                Ok(()) => Err(cause),
                Err(undo) => {
                    error!("rename {from}: rollback of shadow metadata failed: {undo}");
                    Err(TierError::inconsistent(
                        from,
                        format!("rename rollback failed ({cause})"),
                    ))
                }
            };
        }
        Ok(())
    }

    /// Pick a slow-store path for `path`, never reusing an occupied name.
    async fn allocate_slow(&self, path: &VirtualPath) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| TierError::InvalidPath(path.to_string()))?
            .to_os_string();
        let mirrored = path.under(&self.config.slow_root)?;
        let mut dir = mirrored
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.slow_root.clone());
        if let Err(e) = self.storage.create_dir_all(&dir).await {
            // A slow-store file may already occupy a parent component.
            warn!("promote {path}: cannot mirror {}: {e}", dir.display());
            dir = self.config.slow_root.clone();
        }

        let candidate = dir.join(&name);
        if !self.occupied(&candidate).await? {
            return Ok(candidate);
        }
        let mut unique = OsString::from(&name);
        unique.push(format!(".{}", uuid::Uuid::new_v4().simple()));
        if unique.len() > libc::NAME_MAX as usize {
            unique = OsString::from(uuid::Uuid::new_v4().simple().to_string());
        }
        Ok(dir.join(unique))
    }

    async fn occupied(&self, candidate: &Path) -> Result<bool> {
        match self.storage.symlink_metadata(candidate).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TierError::from_io(e, candidate.display())),
        }
    }

    async fn located(
        &self,
        path: &VirtualPath,
        tier: Tier,
        fast: &Path,
        physical: PathBuf,
    ) -> Result<Location> {
        let fast_meta = self
            .storage
            .symlink_metadata(fast)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        Ok(Location {
            tier,
            fast: fast.to_path_buf(),
            physical,
            fast_meta,
        })
    }
}
