//! Overlay driver: kernel overlayfs with per-container upper/work dirs.

use std::fs;
use std::path::Path;

use nix::mount::{mount, MsFlags};

use super::{volume_key, StorageDriver, OVERLAY};
use crate::container::Container;
use crate::errors::{Error, Result};
use crate::util;

pub struct OverlayDriver;

impl StorageDriver for OverlayDriver {
    fn name(&self) -> &'static str {
        OVERLAY
    }

    fn allowed(&self) -> bool {
        util::fs_supported("overlay")
    }

    fn dirs(&self) -> &'static [&'static str] {
        &["diff", "merged", "work"]
    }

    fn mount_rootfs(&self, c: &Container) -> Result<()> {
        let work_dir = c.rootfs.container_dir.join("work");
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            c.rootfs.image_dir.display(),
            c.rootfs.write_dir.display(),
            work_dir.display(),
        );
        overlay_mount(&c.rootfs.merge_dir, &options)
    }

    fn mount_volume(&self, c: &Container) -> Result<()> {
        for (source, inner) in &c.volumes {
            let key = volume_key(source);
            let volume_dir = c.rootfs.container_dir.join("volumes").join(&key);
            let lower_dir = volume_dir.join("lower");
            let work_dir = volume_dir.join("work");
            let target = c.volume_target(inner);

            for dir in [
                lower_dir.as_path(),
                work_dir.as_path(),
                Path::new(source),
                target.as_path(),
            ] {
                fs::create_dir_all(dir)?;
            }

            // The host source acts as the upper layer, so writes from either
            // side stay visible on the host.
            let options = format!(
                "lowerdir={},upperdir={},workdir={}",
                lower_dir.display(),
                source,
                work_dir.display(),
            );
            overlay_mount(&target, &options)?;
            tracing::debug!(source, target = %target.display(), "mounted volume");
        }
        Ok(())
    }
}

fn overlay_mount(target: &Path, options: &str) -> Result<()> {
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|e| {
        Error::Storage(format!(
            "failed to mount overlay on {} ({options}): {e}",
            target.display()
        ))
    })
}
