use std::path::{Path, PathBuf};

use crate::error::{Result, TierError};

/// Cutoff used when none is configured.
pub const DEFAULT_THRESHOLD: u64 = 512;

/// Size cutoff: files at or above it live in the slow store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThresholdPolicy {
    threshold: u64,
}

impl ThresholdPolicy {
    pub fn new(threshold: u64) -> Result<Self> {
        if threshold == 0 {
            return Err(TierError::InvalidConfig(
                "threshold must be greater than zero".into(),
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn belongs_in_slow(&self, size: u64) -> bool {
        size >= self.threshold
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Process-wide configuration, built once at startup and shared read-only.
#[derive(Clone, Debug)]
pub struct TierConfig {
    pub fast_root: PathBuf,
    pub slow_root: PathBuf,
    pub policy: ThresholdPolicy,
}

impl TierConfig {
    pub fn new(
        fast_root: impl AsRef<Path>,
        slow_root: impl AsRef<Path>,
        threshold: u64,
    ) -> Result<Self> {
        let policy = ThresholdPolicy::new(threshold)?;
        let fast_root = canonical_dir(fast_root.as_ref(), "fast")?;
        let slow_root = canonical_dir(slow_root.as_ref(), "slow")?;
        if fast_root.starts_with(&slow_root) || slow_root.starts_with(&fast_root) {
            return Err(TierError::InvalidConfig(format!(
                "fast store {} and slow store {} must not overlap",
                fast_root.display(),
                slow_root.display()
            )));
        }
        Ok(Self {
            fast_root,
            slow_root,
            policy,
        })
    }

    pub fn threshold(&self) -> u64 {
        self.policy.threshold()
    }
}

fn canonical_dir(path: &Path, which: &str) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        TierError::InvalidConfig(format!("{which} store {}: {e}", path.display()))
    })?;
    if !canonical.is_dir() {
        return Err(TierError::InvalidConfig(format!(
            "{which} store {} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Parse a byte size such as `512`, `4K`, `16MiB` or `2G`.
pub fn parse_size(input: &str) -> std::result::Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{input}'"))?;
    let shift = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("unknown size unit '{other}'")),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{input}' overflows"))
}
