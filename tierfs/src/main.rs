// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Command-line entry point: mount the tiering filesystem, or check/repair
// the stores offline.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tierfs::config::parse_size;
use tierfs::fuse::mount::{MountFlags, mount};
use tierfs::repair::{self, ScanReport};
use tierfs::storage::{RECORD_XATTR, verify_record_marks};
use tierfs::{DEFAULT_THRESHOLD, TierConfig, TierFs, TierFuse};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(version, about = "Size-tiered FUSE filesystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount the tiered view of the two stores
    Mount(MountArgs),
    /// Scan the stores for inconsistent tier artifacts
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct Stores {
    /// Fast store directory
    #[arg(long, env = "TIERFS_FAST_ROOT")]
    fast: PathBuf,

    /// Slow store directory
    #[arg(long, env = "TIERFS_SLOW_ROOT")]
    slow: PathBuf,

    /// Files at or above this size live in the slow store (512, 4K, 1M, ...)
    #[arg(long, env = "TIERFS_THRESHOLD", default_value_t = DEFAULT_THRESHOLD, value_parser = parse_size)]
    threshold: u64,
}

impl Stores {
    fn config(&self) -> Result<TierConfig> {
        TierConfig::new(&self.fast, &self.slow, self.threshold).context("invalid store configuration")
    }
}

#[derive(Args, Debug)]
struct MountArgs {
    #[command(flatten)]
    stores: Stores,

    /// Path to mount point
    #[arg(long)]
    mountpoint: PathBuf,

    /// Mount directly instead of through fusermount3
    #[arg(long)]
    privileged: bool,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    stores: Stores,

    /// Fix what can be fixed safely
    #[arg(long)]
    repair: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Mount(args) => run_mount(args).await,
        Command::Check(args) => run_check(args).await,
    }
}

async fn run_mount(args: MountArgs) -> Result<()> {
    let config = args.stores.config()?;
    verify_record_marks(&config.fast_root).with_context(|| {
        format!(
            "fast store {} cannot hold the {:?} extended attribute",
            config.fast_root.display(),
            RECORD_XATTR
        )
    })?;
    let fs = TierFuse::new(TierFs::new(config));
    let flags = MountFlags {
        privileged: args.privileged,
        allow_other: args.allow_other,
    };
    let mut mount_handle = mount(fs, &args.mountpoint, flags)
        .await
        .with_context(|| format!("mount at {} failed", args.mountpoint.display()))?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session failed")?,
        _ = signal::ctrl_c() => {
            log::info!("unmounting {}", args.mountpoint.display());
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}

async fn run_check(args: CheckArgs) -> Result<()> {
    let config = args.stores.config()?;
    let report = repair::scan(&config).await.context("scan failed")?;
    print_report(&report);

    if args.repair {
        let summary = repair::repair(&config, &report).await.context("repair failed")?;
        println!(
            "repaired: {} temporaries removed, {} shadows removed, {} shadows restored",
            summary.removed_temps, summary.removed_shadows, summary.resnapshotted
        );
    } else if !report.is_clean() {
        bail!("{} issue(s) found; rerun with --repair", report.issues());
    }
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!("records: {}", report.records);
    for rec in &report.dangling_records {
        println!("dangling record: {}", rec.fast.display());
    }
    for rec in &report.missing_targets {
        println!(
            "missing slow file: {} -> {}",
            rec.fast.display(),
            rec.target.display()
        );
    }
    for path in &report.orphan_shadows {
        println!("orphan shadow: {}", path.display());
    }
    for path in &report.corrupt_shadows {
        println!("corrupt shadow: {}", path.display());
    }
    for path in &report.orphan_slow_files {
        println!("orphan slow file: {}", path.display());
    }
    for path in &report.stale_temps {
        println!("stale temporary: {}", path.display());
    }
}
