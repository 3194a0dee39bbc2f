//! Locating and manipulating cgroup-v1 hierarchies on the host.
//!
//! Each controller is an independent mount tree; the mount point is found by
//! scanning `/proc/self/mountinfo` for the first `cgroup` superblock whose
//! mount point ends with the controller's root name (which may be composite,
//! e.g. `cpu,cpuacct`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::util;

pub const CGROUP_PROCS: &str = "cgroup.procs";

const MOUNTINFO: &str = "/proc/self/mountinfo";
const SELF_CGROUP: &str = "/proc/self/cgroup";

/// Whether the controller named `root_name` is mounted at all, according to
/// `/proc/self/cgroup` (lines are `id:controllers:path`).
pub fn subsystem_mounted(root_name: &str) -> bool {
    let Ok(contents) = fs::read_to_string(SELF_CGROUP) else {
        return false;
    };
    contents
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .any(|controllers| controllers == root_name)
}

/// Mount point of the controller, from `/proc/self/mountinfo`.
pub fn mount_point(root_name: &str) -> Result<PathBuf> {
    let contents = fs::read_to_string(MOUNTINFO)?;
    parse_mount_point(&contents, root_name)
        .ok_or_else(|| Error::Cgroup(format!("subsystem {root_name} is not mounted")))
}

/// mountinfo lines look like:
/// `33 24 0:29 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid - cgroup cgroup rw,cpu,cpuacct`
/// The fields after ` - ` are fstype, source, super options.
fn parse_mount_point(mountinfo: &str, root_name: &str) -> Option<PathBuf> {
    for line in mountinfo.lines() {
        let (pre, post) = match line.split_once(" - ") {
            Some(parts) => parts,
            None => continue,
        };
        if post.split_whitespace().next() != Some("cgroup") {
            continue;
        }
        let mount_point = pre.split_whitespace().nth(4)?;
        if mount_point.ends_with(&format!("/{root_name}")) {
            return Some(PathBuf::from(mount_point));
        }
    }
    None
}

/// The container's directory under the controller root, created on demand.
pub fn subsystem_path(root_name: &str, cg_path: &str) -> Result<PathBuf> {
    let full = mount_point(root_name)?.join(cg_path.trim_start_matches('/'));
    fs::create_dir_all(&full)
        .map_err(|e| Error::Cgroup(format!("failed to mkdir {}: {e}", full.display())))?;
    Ok(full)
}

/// Write one control file; the value is logged at debug level.
pub fn write_value(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    tracing::debug!("set {file} => {value}");
    fs::write(&path, value)
        .map_err(|e| Error::Cgroup(format!("failed to write {} = {value}: {e}", path.display())))
}

/// Place `pid` into the controller's `cgroup.procs` at `cg_path`.
pub fn apply(root_name: &str, cg_path: &str, pid: i32) -> Result<()> {
    let dir = subsystem_path(root_name, cg_path)?;
    write_value(&dir, CGROUP_PROCS, &pid.to_string())
}

/// Tear down the controller directory at `cg_path`.
///
/// Remaining pids (zombies the init didn't reap) are terminated in reverse
/// order and any survivor is migrated to the parent cgroup; the kernel only
/// accepts one pid per `cgroup.procs` write. Cgroup directories refuse
/// recursive file deletion, so the final step is a plain rmdir.
pub fn remove(root_name: &str, cg_path: &str) -> Result<()> {
    let dir = subsystem_path(root_name, cg_path)?;
    let procs_file = dir.join(CGROUP_PROCS);

    let procs = fs::read_to_string(&procs_file).unwrap_or_default();
    let mut pids: Vec<i32> = procs.lines().filter_map(|l| l.trim().parse().ok()).collect();
    pids.reverse();

    if !pids.is_empty() {
        tracing::debug!(path = %dir.display(), ?pids, "cgroup still has processes");
        let parent_procs = dir
            .parent()
            .map(|p| p.join(CGROUP_PROCS))
            .ok_or_else(|| Error::Cgroup(format!("{} has no parent cgroup", dir.display())))?;

        for pid in pids {
            unsafe { libc::kill(pid, libc::SIGTERM) };
            std::thread::sleep(Duration::from_millis(100));
            if util::is_process_alive(pid) {
                unsafe { libc::kill(pid, libc::SIGKILL) };
            }
            if util::is_process_alive(pid) {
                tracing::debug!(pid, "migrating survivor to parent cgroup");
                fs::write(&parent_procs, pid.to_string())?;
            }
        }
    }

    fs::remove_dir(&dir)
        .map_err(|e| Error::Cgroup(format!("failed to rmdir {}: {e}", dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
24 30 0:22 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
30 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
33 25 0:29 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:10 - cgroup cgroup rw,cpu,cpuacct
34 25 0:30 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:11 - cgroup cgroup rw,memory
35 25 0:31 / /sys/fs/cgroup/net_cls,net_prio rw,nosuid shared:12 - cgroup cgroup rw,net_cls,net_prio
36 25 0:32 / /tmp/not-a-cgroup/memory rw - tmpfs tmpfs rw";

    #[test]
    fn test_parse_mount_point_simple() {
        assert_eq!(
            parse_mount_point(SAMPLE, "memory"),
            Some(PathBuf::from("/sys/fs/cgroup/memory"))
        );
    }

    #[test]
    fn test_parse_mount_point_composite() {
        assert_eq!(
            parse_mount_point(SAMPLE, "cpu,cpuacct"),
            Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(
            parse_mount_point(SAMPLE, "net_cls,net_prio"),
            Some(PathBuf::from("/sys/fs/cgroup/net_cls,net_prio"))
        );
    }

    #[test]
    fn test_parse_mount_point_ignores_non_cgroup_fstype() {
        // /tmp/not-a-cgroup/memory ends with /memory but is a tmpfs.
        let only_tmpfs = "36 25 0:32 / /tmp/not-a-cgroup/memory rw - tmpfs tmpfs rw";
        assert_eq!(parse_mount_point(only_tmpfs, "memory"), None);
    }

    #[test]
    fn test_parse_mount_point_absent() {
        assert_eq!(parse_mount_point(SAMPLE, "pids"), None);
    }
}
