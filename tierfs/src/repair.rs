//! Offline consistency scan and repair.
//!
//! Meant to run while the stores are not mounted. The scan only reads; the
//! repair pass fixes what can be fixed without guessing and leaves the rest
//! in the report.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::config::TierConfig;
use crate::error::{Result, TierError};
use crate::path::{is_temp_name, shadow_name, shadowed_name};
use crate::storage::{LocalStorage, Storage};
use crate::tier::record::{self, IndirectionRecord, MAX_RECORD_LEN};
use crate::tier::shadow::{SHADOW_RECORD_LEN, ShadowMetadata, ShadowStore};

/// An indirection record and the slow-store file it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordRef {
    pub fast: PathBuf,
    pub target: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Records without shadow metadata.
    pub dangling_records: Vec<RecordRef>,
    /// Shadow metadata without a record beside it.
    pub orphan_shadows: Vec<PathBuf>,
    /// Shadow metadata that fails schema validation.
    pub corrupt_shadows: Vec<PathBuf>,
    /// Records whose slow-store file is gone.
    pub missing_targets: Vec<RecordRef>,
    /// Slow-store files no record points at.
    pub orphan_slow_files: Vec<PathBuf>,
    /// Leftovers of interrupted atomic writes or cross-device copies.
    pub stale_temps: Vec<PathBuf>,
    pub records: usize,
}

impl ScanReport {
    pub fn issues(&self) -> usize {
        self.dangling_records.len()
            + self.orphan_shadows.len()
            + self.corrupt_shadows.len()
            + self.missing_targets.len()
            + self.orphan_slow_files.len()
            + self.stale_temps.len()
    }

    pub fn is_clean(&self) -> bool {
        self.issues() == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub removed_temps: usize,
    pub removed_shadows: usize,
    pub resnapshotted: usize,
}

pub async fn scan(config: &TierConfig) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut referenced = HashSet::new();

    let mut dirs = vec![config.fast_root.clone()];
    while let Some(dir) = dirs.pop() {
        scan_fast_dir(&dir, &mut dirs, &mut referenced, &mut report).await?;
    }

    let mut dirs = vec![config.slow_root.clone()];
    while let Some(dir) = dirs.pop() {
        let mut rd = fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let ft = entry.file_type().await?;
            let path = entry.path();
            if ft.is_dir() {
                dirs.push(path);
            } else if is_temp_name(&entry.file_name()) {
                report.stale_temps.push(path);
            } else if ft.is_file() && !referenced.contains(&path) {
                report.orphan_slow_files.push(path);
            }
        }
    }

    info!(
        "scan: {} records, {} issues",
        report.records,
        report.issues()
    );
    Ok(report)
}

async fn scan_fast_dir(
    dir: &Path,
    dirs: &mut Vec<PathBuf>,
    referenced: &mut HashSet<PathBuf>,
    report: &mut ScanReport,
) -> Result<()> {
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        let path = entry.path();
        let ft = entry.file_type().await?;

        if is_temp_name(&name) {
            report.stale_temps.push(path);
            continue;
        }
        if let Some(shadowed) = shadowed_name(&name) {
            let owner = dir.join(shadowed);
            if read_record(&owner).await?.is_none() {
                report.orphan_shadows.push(path);
            } else if !shadow_is_valid(&path).await? {
                report.corrupt_shadows.push(path);
            }
            continue;
        }
        if ft.is_dir() {
            dirs.push(path);
            continue;
        }
        let Some(rec) = read_record(&path).await? else {
            continue;
        };
        report.records += 1;
        referenced.insert(rec.target.clone());
        let found = RecordRef {
            fast: path,
            target: rec.target,
        };
        if !exists(&dir.join(shadow_name(&name))).await? {
            warn!("dangling record {}", found.fast.display());
            report.dangling_records.push(found.clone());
        }
        if !exists(&found.target).await? {
            warn!(
                "record {} points at missing {}",
                found.fast.display(),
                found.target.display()
            );
            report.missing_targets.push(found);
        }
    }
    Ok(())
}

/// Decode `path` as an indirection record, if it is one.
async fn read_record(path: &Path) -> Result<Option<IndirectionRecord>> {
    let meta = match fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TierError::from_io(e, path.display())),
    };
    if !meta.is_file() || !record::plausible_len(meta.len()) {
        return Ok(None);
    }
    let marked = LocalStorage
        .is_record(path)
        .await
        .map_err(|e| TierError::from_io(e, path.display()))?;
    if !marked {
        return Ok(None);
    }
    let bytes = fs::read(path).await?;
    if bytes.len() as u64 > MAX_RECORD_LEN {
        return Ok(None);
    }
    Ok(IndirectionRecord::decode(&bytes))
}

async fn shadow_is_valid(path: &Path) -> Result<bool> {
    let bytes = fs::read(path).await?;
    if bytes.len() != SHADOW_RECORD_LEN {
        return Ok(false);
    }
    Ok(ShadowMetadata::decode(&bytes, path).is_ok())
}

async fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(TierError::from_io(e, path.display())),
    }
}

/// Fix what the scan found and is safe to fix: stale temporaries and orphan
/// shadows are deleted, dangling records whose slow file still exists get a
/// fresh shadow. Everything else needs a decision by hand.
pub async fn repair(config: &TierConfig, report: &ScanReport) -> Result<RepairSummary> {
    let mut summary = RepairSummary::default();

    for temp in &report.stale_temps {
        if remove_tolerant(temp).await? {
            info!("removed stale temporary {}", temp.display());
            summary.removed_temps += 1;
        }
    }
    for shadow in &report.orphan_shadows {
        if remove_tolerant(shadow).await? {
            info!("removed orphan shadow {}", shadow.display());
            summary.removed_shadows += 1;
        }
    }

    let shadows = ShadowStore::new(Arc::new(LocalStorage));
    for rec in &report.dangling_records {
        if !rec.target.starts_with(&config.slow_root) {
            warn!(
                "record {} points outside the slow store, leaving it",
                rec.fast.display()
            );
            continue;
        }
        match shadows.refresh(&rec.fast, &rec.target).await {
            Ok(_) => {
                info!("restored shadow for {}", rec.fast.display());
                summary.resnapshotted += 1;
            }
            Err(e) if e.is_not_found() => {
                warn!("cannot restore shadow for {}: {e}", rec.fast.display());
            }
            Err(e) => return Err(e),
        }
    }

    for orphan in &report.orphan_slow_files {
        warn!("orphan slow-store file left in place: {}", orphan.display());
    }
    for rec in &report.missing_targets {
        warn!(
            "record {} left in place, {} is missing",
            rec.fast.display(),
            rec.target.display()
        );
    }
    Ok(summary)
}

async fn remove_tolerant(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(TierError::from_io(e, path.display())),
    }
}
