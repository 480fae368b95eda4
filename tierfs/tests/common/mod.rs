#![allow(dead_code)]

use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tierfs::storage::{LocalStorage, Storage};
use tierfs::{TierConfig, TierFs, VirtualPath};

pub fn vp(p: &str) -> VirtualPath {
    VirtualPath::new(p).unwrap()
}

pub struct Stores {
    _tmp: TempDir,
    pub fast: PathBuf,
    pub slow: PathBuf,
    pub config: TierConfig,
}

pub fn stores(threshold: u64) -> Stores {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("fast")).unwrap();
    std::fs::create_dir(tmp.path().join("slow")).unwrap();
    let config =
        TierConfig::new(tmp.path().join("fast"), tmp.path().join("slow"), threshold).unwrap();
    Stores {
        fast: config.fast_root.clone(),
        slow: config.slow_root.clone(),
        config,
        _tmp: tmp,
    }
}

/// Names of a directory, sorted.
pub fn names(dir: &Path) -> Vec<String> {
    let mut out: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    out.sort();
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    WriteAtomic,
    Rename,
    MoveFile,
    RemoveFile,
    CreateDirAll,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    name: String,
    /// Matching calls to let through before failing.
    skip: usize,
}

/// [`Storage`] that fails chosen calls with `EIO`.
///
/// A fault matches when the operation is the same and the basename of one of
/// the call's paths equals the armed name. Each fault fires once.
#[derive(Clone, Default)]
pub struct FaultyStorage {
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl FaultyStorage {
    pub fn fail(&self, op: Op, name: &str) {
        self.fail_after(op, name, 0);
    }

    pub fn fail_after(&self, op: Op, name: &str, skip: usize) {
        self.faults.lock().unwrap().push(Fault {
            op,
            name: name.to_string(),
            skip,
        });
    }

    pub fn armed(&self) -> usize {
        self.faults.lock().unwrap().len()
    }

    fn check(&self, op: Op, paths: &[&Path]) -> io::Result<()> {
        let mut faults = self.faults.lock().unwrap();
        let hit = faults.iter().position(|f| {
            f.op == op
                && paths
                    .iter()
                    .any(|p| p.file_name() == Some(OsStr::new(&f.name)))
        });
        if let Some(i) = hit {
            if faults[i].skip > 0 {
                faults[i].skip -= 1;
                return Ok(());
            }
            faults.remove(i);
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn symlink_metadata(&self, path: &Path) -> io::Result<Metadata> {
        LocalStorage.symlink_metadata(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<Metadata> {
        LocalStorage.metadata(path).await
    }

    async fn read_prefix(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>> {
        LocalStorage.read_prefix(path, limit).await
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.check(Op::WriteAtomic, &[path])?;
        LocalStorage.write_atomic(path, data).await
    }

    async fn write_record(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.check(Op::WriteAtomic, &[path])?;
        LocalStorage.write_record(path, data).await
    }

    async fn is_record(&self, path: &Path) -> io::Result<bool> {
        LocalStorage.is_record(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(Op::Rename, &[from, to])?;
        LocalStorage.rename(from, to).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(Op::MoveFile, &[from, to])?;
        LocalStorage.move_file(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check(Op::RemoveFile, &[path])?;
        LocalStorage.remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check(Op::CreateDirAll, &[path])?;
        LocalStorage.create_dir_all(path).await
    }
}

pub fn faulty_fs(stores: &Stores) -> (TierFs<FaultyStorage>, FaultyStorage) {
    let storage = FaultyStorage::default();
    (
        TierFs::with_storage(stores.config.clone(), storage.clone()),
        storage,
    )
}
