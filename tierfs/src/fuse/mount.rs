//! Mount helpers for starting/stopping FUSE
//!
//! Thin wrappers over the rfuse3 raw Session APIs. Unprivileged mounts go
//! through fusermount3, which must be in PATH.

use std::io;
use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use crate::fuse::TierFuse;
use crate::storage::Storage;

#[derive(Clone, Copy, Debug, Default)]
pub struct MountFlags {
    /// Mount directly instead of through fusermount3.
    pub privileged: bool,
    pub allow_other: bool,
}

fn mount_options(flags: MountFlags) -> MountOptions {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let mut mo = MountOptions::default();
    mo.fs_name("tierfs")
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid)
        .allow_other(flags.allow_other);
    mo
}

pub async fn mount<S: Storage>(
    fs: TierFuse<S>,
    mount_point: impl AsRef<Path>,
    flags: MountFlags,
) -> io::Result<MountHandle> {
    let mount_point = mount_point.as_ref();
    let session = Session::new(mount_options(flags));
    if flags.privileged {
        info!("mounting tierfs at {} (privileged)", mount_point.display());
        session.mount(fs, mount_point).await
    } else {
        info!("mounting tierfs at {} (unprivileged)", mount_point.display());
        session.mount_with_unprivileged(fs, mount_point).await
    }
}
