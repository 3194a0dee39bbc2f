//! Aufs driver: branch union mount with a shared tmpfs xino scratch.

use std::fs;
use std::path::Path;

use nix::mount::{mount, MsFlags};

use super::{StorageDriver, AUFS};
use crate::container::Container;
use crate::errors::{Error, Result};
use crate::util;

/// The xino file must not live on xfs, so it is kept on a dedicated tmpfs
/// shared by every aufs mount in the process.
pub const XINO_TMPFS: &str = "/var/local/xino";

pub struct AufsDriver;

impl StorageDriver for AufsDriver {
    fn name(&self) -> &'static str {
        AUFS
    }

    fn allowed(&self) -> bool {
        util::fs_supported("aufs")
    }

    fn dirs(&self) -> &'static [&'static str] {
        &["diff", "merged"]
    }

    fn mount_rootfs(&self, c: &Container) -> Result<()> {
        mount_xino_tmpfs()?;

        let options = format!(
            "xino={XINO_TMPFS}/.xino,dirs={}:{}",
            c.rootfs.write_dir.display(),
            c.rootfs.image_dir.display(),
        );
        aufs_mount(&c.rootfs.merge_dir, &options)
    }

    fn mount_volume(&self, c: &Container) -> Result<()> {
        for (source, inner) in &c.volumes {
            let target = c.volume_target(inner);
            fs::create_dir_all(source)?;
            fs::create_dir_all(&target)?;

            let options = format!("xino={XINO_TMPFS}/.xino,dirs={source}");
            aufs_mount(&target, &options)?;
            tracing::debug!(source, target = %target.display(), "mounted volume");
        }
        Ok(())
    }
}

fn mount_xino_tmpfs() -> Result<()> {
    let xino = Path::new(XINO_TMPFS);
    if util::is_mounted(xino) {
        return Ok(());
    }
    fs::create_dir_all(xino)?;
    mount(
        Some("tmpfs"),
        xino,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=100M"),
    )
    .map_err(|e| Error::Storage(format!("failed to mount xino tmpfs: {e}")))
}

fn aufs_mount(target: &Path, options: &str) -> Result<()> {
    mount(
        Some("none"),
        target,
        Some("aufs"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|e| {
        Error::Storage(format!(
            "failed to mount aufs on {} ({options}): {e}",
            target.display()
        ))
    })
}
