//! Layered root-filesystem drivers.
//!
//! A driver union-mounts one read-only image directory with a per-container
//! write layer into `<merged>`, and bind-mounts declared volumes on top.
//! The set of drivers is closed: overlay and aufs, registered here.

mod aufs;
mod overlay;

pub use aufs::AufsDriver;
pub use overlay::OverlayDriver;

use std::path::Path;
use std::time::Duration;

use nix::mount::{umount2, MntFlags};

use crate::container::Container;
use crate::errors::Result;
use crate::util;

pub const OVERLAY: &str = "overlay";
pub const AUFS: &str = "aufs";

pub trait StorageDriver {
    fn name(&self) -> &'static str;

    /// Probe whether the kernel can service this driver at all.
    fn allowed(&self) -> bool;

    /// Subdirectories of the container dir this driver needs.
    fn dirs(&self) -> &'static [&'static str];

    /// Union-mount the image under the container's merge dir.
    fn mount_rootfs(&self, c: &Container) -> Result<()>;

    /// Mount every declared volume onto `<merged>/<target>`.
    fn mount_volume(&self, c: &Container) -> Result<()>;
}

/// All storage drivers, in probe order.
pub fn registry() -> Vec<Box<dyn StorageDriver>> {
    vec![Box::new(OverlayDriver), Box::new(AufsDriver)]
}

/// Unmount `target` if it is mounted; a no-op otherwise.
///
/// Busy mounts are retried with backoff, every attempt bounded by a 5 s
/// timeout; the last attempt detaches lazily so the call completes even
/// when a process still holds the mount.
pub fn unmount(target: &Path) -> Result<()> {
    if !target.exists() || !util::is_mounted(target) {
        return Ok(());
    }

    const ATTEMPTS: u32 = 3;
    for attempt in 1..=ATTEMPTS {
        let flags = if attempt == ATTEMPTS {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        match attempt_umount(target, flags) {
            Some(Ok(())) => return Ok(()),
            Some(Err(nix::errno::Errno::EINVAL)) | Some(Err(nix::errno::Errno::ENOENT)) => {
                // Raced with another teardown; nothing left to unmount.
                return Ok(());
            }
            Some(Err(e)) if attempt < ATTEMPTS => {
                tracing::debug!(mount = %target.display(), attempt, "umount busy: {e}");
                std::thread::sleep(Duration::from_millis(500));
            }
            Some(Err(e)) => return Err(crate::errors::Error::kernel("umount", e)),
            None if attempt < ATTEMPTS => {
                tracing::debug!(mount = %target.display(), attempt, "umount timed out");
                std::thread::sleep(Duration::from_millis(500));
            }
            None => {
                return Err(crate::errors::Error::Storage(format!(
                    "umount of {} timed out",
                    target.display()
                )))
            }
        }
    }
    unreachable!()
}

const UMOUNT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One bounded umount attempt. A wedged superblock can block umount(2)
/// indefinitely, so the syscall runs on a helper thread and the caller
/// waits at most [`UMOUNT_ATTEMPT_TIMEOUT`]; `None` means the attempt
/// expired (the thread is left to finish on its own).
fn attempt_umount(target: &Path, flags: MntFlags) -> Option<nix::Result<()>> {
    let (tx, rx) = std::sync::mpsc::channel();
    let path = target.to_path_buf();
    std::thread::spawn(move || {
        let _ = tx.send(umount2(&path, flags));
    });
    rx.recv_timeout(UMOUNT_ATTEMPT_TIMEOUT).ok()
}

/// Per-volume scratch directory name, derived from the host source path.
///
/// Trailing slashes are trimmed before hashing so `/src` and `/src/` dedup
/// to the same volume.
pub fn volume_key(source: &str) -> String {
    let trimmed = source.trim_end_matches('/');
    util::sha256_hex(trimmed)[..8].to_string()
}
