use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::TierConfig;
use crate::error::{Result, TierError};
use crate::path::VirtualPath;
use crate::storage::Storage;
use crate::tier::record::{self, IndirectionRecord, MAX_RECORD_LEN};
use crate::tier::shadow::ShadowStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Slow,
}

/// Where a virtual path lives, valid for the duration of one operation.
#[derive(Clone, Debug)]
pub struct Location {
    pub tier: Tier,
    /// Fast-store path: the file itself, or its indirection record.
    pub fast: PathBuf,
    /// Path holding the bytes.
    pub physical: PathBuf,
    /// Metadata of the fast-store entry, not followed through symlinks.
    pub fast_meta: Metadata,
}

impl Location {
    pub fn is_slow(&self) -> bool {
        self.tier == Tier::Slow
    }
}

/// Maps virtual paths to a tier and a physical location by inspecting the
/// fast-store entry. Pure lookup: never repairs what it finds, and only opens
/// a file once its record mark says it is one.
pub struct Resolver<S: Storage> {
    config: Arc<TierConfig>,
    storage: Arc<S>,
    shadows: Arc<ShadowStore<S>>,
}

impl<S: Storage> Resolver<S> {
    pub fn new(config: Arc<TierConfig>, storage: Arc<S>, shadows: Arc<ShadowStore<S>>) -> Self {
        Self {
            config,
            storage,
            shadows,
        }
    }

    pub fn fast_path(&self, path: &VirtualPath) -> Result<PathBuf> {
        path.under(&self.config.fast_root)
    }

    pub fn slow_path(&self, path: &VirtualPath) -> Result<PathBuf> {
        path.under(&self.config.slow_root)
    }

    pub async fn resolve(&self, path: &VirtualPath) -> Result<Location> {
        let fast = self.fast_path(path)?;
        let fast_meta = self
            .storage
            .symlink_metadata(&fast)
            .await
            .map_err(|e| TierError::from_io(e, path))?;

        if !fast_meta.file_type().is_file() {
            return Ok(Location {
                tier: Tier::Fast,
                physical: fast.clone(),
                fast,
                fast_meta,
            });
        }

        let marked = self
            .storage
            .is_record(&fast)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        let shadowed = self.shadows.exists(&fast).await?;

        match (marked, shadowed) {
            (false, false) => Ok(Location {
                tier: Tier::Fast,
                physical: fast.clone(),
                fast,
                fast_meta,
            }),
            (false, true) => {
                error!("{path}: shadow metadata present but fast entry is not an indirection record");
                Err(TierError::inconsistent(
                    path,
                    "shadow metadata without indirection record",
                ))
            }
            (true, false) => {
                error!("{path}: indirection record without shadow metadata");
                Err(TierError::inconsistent(
                    path,
                    "indirection record without shadow metadata",
                ))
            }
            (true, true) => {
                let record = self.read_record(path, &fast, fast_meta.len()).await?;
                let Some(record) = record else {
                    error!("{path}: indirection record does not decode");
                    return Err(TierError::inconsistent(path, "undecodable indirection record"));
                };
                Ok(Location {
                    tier: Tier::Slow,
                    physical: record.target,
                    fast,
                    fast_meta,
                })
            }
        }
    }

    async fn read_record(
        &self,
        path: &VirtualPath,
        fast: &std::path::Path,
        len: u64,
    ) -> Result<Option<IndirectionRecord>> {
        if !record::plausible_len(len) {
            return Ok(None);
        }
        let bytes = self
            .storage
            .read_prefix(fast, MAX_RECORD_LEN as usize)
            .await
            .map_err(|e| TierError::from_io(e, path))?;
        Ok(IndirectionRecord::decode(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use crate::tier::shadow::ShadowMetadata;

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: Arc<TierConfig>,
        resolver: Resolver<LocalStorage>,
        shadows: Arc<ShadowStore<LocalStorage>>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("fast")).unwrap();
        std::fs::create_dir(tmp.path().join("slow")).unwrap();
        let config =
            Arc::new(TierConfig::new(tmp.path().join("fast"), tmp.path().join("slow"), 64).unwrap());
        let storage = Arc::new(LocalStorage);
        let shadows = Arc::new(ShadowStore::new(storage.clone()));
        let resolver = Resolver::new(config.clone(), storage, shadows.clone());
        Fixture {
            _tmp: tmp,
            config,
            resolver,
            shadows,
        }
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let fx = fixture();
        let err = fx
            .resolver
            .resolve(&VirtualPath::new("/nope").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn plain_entries_are_fast() {
        let fx = fixture();
        std::fs::write(fx.config.fast_root.join("small"), b"abc").unwrap();
        std::fs::create_dir(fx.config.fast_root.join("dir")).unwrap();
        std::os::unix::fs::symlink("/small", fx.config.fast_root.join("link")).unwrap();

        for name in ["/small", "/dir", "/link"] {
            let loc = fx
                .resolver
                .resolve(&VirtualPath::new(name).unwrap())
                .await
                .unwrap();
            assert_eq!(loc.tier, Tier::Fast, "{name}");
            assert_eq!(loc.physical, loc.fast);
        }
    }

    #[tokio::test]
    async fn record_with_shadow_is_slow() {
        let fx = fixture();
        let slow = fx.config.slow_root.join("big");
        std::fs::write(&slow, vec![7u8; 100]).unwrap();
        let fast = fx.config.fast_root.join("big");
        LocalStorage
            .write_record(&fast, &IndirectionRecord::new(&slow).encode())
            .await
            .unwrap();
        let meta = std::fs::metadata(&slow).unwrap();
        fx.shadows
            .save(&fast, &ShadowMetadata::from_metadata(&meta))
            .await
            .unwrap();

        let loc = fx
            .resolver
            .resolve(&VirtualPath::new("/big").unwrap())
            .await
            .unwrap();
        assert!(loc.is_slow());
        assert_eq!(loc.physical, slow);
        assert_eq!(loc.fast, fast);
    }

    #[tokio::test]
    async fn dangling_record_is_inconsistent() {
        let fx = fixture();
        let fast = fx.config.fast_root.join("big");
        LocalStorage
            .write_record(&fast, &IndirectionRecord::new("/elsewhere/big").encode())
            .await
            .unwrap();
        let err = fx
            .resolver
            .resolve(&VirtualPath::new("/big").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn shadow_beside_plain_file_is_inconsistent() {
        let fx = fixture();
        let fast = fx.config.fast_root.join("f");
        std::fs::write(&fast, b"not a record at all, just bytes").unwrap();
        let meta = std::fs::metadata(&fast).unwrap();
        fx.shadows
            .save(&fast, &ShadowMetadata::from_metadata(&meta))
            .await
            .unwrap();
        let err = fx
            .resolver
            .resolve(&VirtualPath::new("/f").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn record_bytes_without_mark_are_user_data() {
        let fx = fixture();
        let fast = fx.config.fast_root.join("doc");
        std::fs::write(&fast, IndirectionRecord::new("/elsewhere/doc").encode()).unwrap();
        let before = std::fs::metadata(&fast).unwrap();

        let path = VirtualPath::new("/doc").unwrap();
        let loc = fx.resolver.resolve(&path).await.unwrap();
        assert_eq!(loc.tier, Tier::Fast);
        assert_eq!(loc.physical, fast);
        let again = fx.resolver.resolve(&path).await.unwrap();
        assert_eq!(again.fast_meta.accessed().unwrap(), before.accessed().unwrap());
    }

    #[tokio::test]
    async fn marked_garbage_with_shadow_is_inconsistent() {
        let fx = fixture();
        let fast = fx.config.fast_root.join("big");
        LocalStorage.write_record(&fast, b"no header here").await.unwrap();
        let meta = std::fs::metadata(&fast).unwrap();
        fx.shadows
            .save(&fast, &ShadowMetadata::from_metadata(&meta))
            .await
            .unwrap();
        let err = fx
            .resolver
            .resolve(&VirtualPath::new("/big").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TierError::InconsistentState { .. }));
    }
}
