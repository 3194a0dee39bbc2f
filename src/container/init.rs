//! The in-namespace init process (`mydocker init`, hidden).
//!
//! Runs as pid 1 inside the freshly-cloned namespaces with its cwd already
//! at the merged rootfs. It blocks reading the command vector from the
//! inherited pipe, pivots into the rootfs, assembles the standard virtual
//! filesystems and device nodes, applies the hostname and execs the user
//! command. It never returns to the parent's code.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, execv, pivot_root, sethostname};

use super::parent::INIT_PIPE_FD;
use super::ENV_HOSTNAME;
use crate::cgroups::CgroupManager;
use crate::errors::{Error, Result};

struct VirtualMount {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

const DEFAULT_MOUNT_FLAGS: MsFlags = MsFlags::MS_NODEV
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NOSUID);

/// The standard virtual filesystems, mounted in order after pivot_root.
const MOUNTS: &[VirtualMount] = &[
    VirtualMount {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: DEFAULT_MOUNT_FLAGS,
        data: None,
    },
    VirtualMount {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: DEFAULT_MOUNT_FLAGS.union(MsFlags::MS_RDONLY),
        data: None,
    },
    VirtualMount {
        source: "tmpfs",
        target: "/dev",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_STRICTATIME),
        data: Some("mode=0755,size=200M"),
    },
    VirtualMount {
        source: "devpts",
        target: "/dev/pts",
        fstype: "devpts",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID),
        data: Some("mode=0620,newinstance,ptmxmode=0666,gid=5"),
    },
    VirtualMount {
        source: "shm",
        target: "/dev/shm",
        fstype: "tmpfs",
        flags: DEFAULT_MOUNT_FLAGS,
        data: Some("mode=1777,size=100M"),
    },
    VirtualMount {
        source: "mqueue",
        target: "/dev/mqueue",
        fstype: "mqueue",
        flags: DEFAULT_MOUNT_FLAGS,
        data: None,
    },
];

struct DeviceNode {
    path: &'static str,
    major: u64,
    minor: u64,
    mode: u32,
}

/// Device nodes every container gets, `file /dev/null` style numbering.
const DEVICES: &[DeviceNode] = &[
    DeviceNode { path: "/dev/null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { path: "/dev/zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { path: "/dev/full", major: 1, minor: 7, mode: 0o666 },
    DeviceNode { path: "/dev/random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { path: "/dev/urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { path: "/dev/tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { path: "/dev/console", major: 5, minor: 1, mode: 0o620 },
];

const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
];

/// Entry point of the hidden `init` subcommand.
pub fn run_init() -> Result<()> {
    let commands = read_commands()?;
    if commands.is_empty() {
        return Err(Error::Validation("init received an empty command".into()));
    }

    setup_rootfs()?;

    if let Ok(hostname) = std::env::var(ENV_HOSTNAME) {
        sethostname(&hostname).map_err(|e| Error::kernel("sethostname", e))?;
    }

    exec_command(&commands)
}

/// Read the NUL-separated command vector from the inherited pipe. Blocks
/// until the parent finishes setup and closes the write end.
fn read_commands() -> Result<Vec<String>> {
    // SAFETY: the parent put the pipe's read end at fd 3 before exec and
    // nothing else owns it in this process.
    let mut pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    let mut raw = String::new();
    pipe.read_to_string(&mut raw)?;

    Ok(raw
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn setup_rootfs() -> Result<()> {
    let root = std::env::current_dir()?;
    tracing::debug!(root = %root.display(), "switching into container rootfs");

    enter_pivot_root(&root)?;

    for m in MOUNTS {
        fs::create_dir_all(m.target)?;
        mount(Some(m.source), m.target, Some(m.fstype), m.flags, m.data)
            .map_err(|e| Error::Storage(format!("failed to mount {} on {}: {e}", m.fstype, m.target)))?;
    }

    create_devices()?;
    create_dev_symlinks();
    mount_cgroup_views();

    Ok(())
}

/// Swap the process root for `root` and drop the old one.
fn enter_pivot_root(root: &Path) -> Result<()> {
    // Keep namespace mounts from propagating back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::kernel("mount private /", e))?;

    // pivot_root requires the new root to be a mount point.
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::kernel("bind mount rootfs", e))?;

    let old_root = root.join(".oldroot");
    fs::create_dir_all(&old_root)?;

    pivot_root(root, &old_root).map_err(|e| Error::kernel("pivot_root", e))?;
    chdir("/").map_err(|e| Error::kernel("chdir", e))?;

    let old_root = PathBuf::from("/.oldroot");
    umount2(&old_root, MntFlags::MNT_DETACH).map_err(|e| Error::kernel("umount old root", e))?;
    fs::remove_dir_all(&old_root)?;

    Ok(())
}

fn create_devices() -> Result<()> {
    // mknod honors the umask; zero it so the table modes land as written.
    let old_mask = nix::sys::stat::umask(Mode::empty());
    let result = DEVICES.iter().try_for_each(|d| {
        mknod(
            d.path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(d.mode),
            makedev(d.major, d.minor),
        )
        .map_err(|e| Error::Storage(format!("failed to mknod {}: {e}", d.path)))
    });
    nix::sys::stat::umask(old_mask);
    result
}

fn create_dev_symlinks() {
    for (target, link) in DEV_SYMLINKS {
        if let Err(e) = std::os::unix::fs::symlink(target, link) {
            tracing::debug!("failed to symlink {link} -> {target}: {e}");
        }
    }
    if Path::new("/proc/kcore").exists() {
        let _ = std::os::unix::fs::symlink("/proc/kcore", "/dev/core");
    }
    if Path::new("/dev/pts/ptmx").exists() {
        let _ = std::os::unix::fs::symlink("/dev/pts/ptmx", "/dev/ptmx");
    }
}

/// Give the container read-only cgroup views: a tmpfs at /sys/fs/cgroup
/// with one read-only controller mount per subsystem the host carries.
/// Best-effort; a container without cgroup views still runs.
fn mount_cgroup_views() {
    const CGROUP_ROOT: &str = "/sys/fs/cgroup";

    if let Err(e) = fs::create_dir_all(CGROUP_ROOT).map_err(Error::from).and_then(|()| {
        mount(
            Some("tmpfs"),
            CGROUP_ROOT,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some("mode=0755"),
        )
        .map_err(|e| Error::kernel("mount cgroup tmpfs", e))
    }) {
        tracing::debug!("skipping cgroup views: {e}");
        return;
    }

    let manager = CgroupManager::new();
    let mut mounted_roots: Vec<&str> = Vec::new();
    for subsystem in manager.subsystems() {
        let root_name = subsystem.root_name();
        if mounted_roots.contains(&root_name)
            || !crate::cgroups::hierarchy::subsystem_mounted(root_name)
        {
            continue;
        }
        mounted_roots.push(root_name);

        let target = format!("{CGROUP_ROOT}/{root_name}");
        let mounted = fs::create_dir_all(&target).is_ok()
            && mount(
                Some("cgroup"),
                target.as_str(),
                Some("cgroup"),
                DEFAULT_MOUNT_FLAGS,
                Some(root_name),
            )
            .is_ok()
            && mount(
                None::<&str>,
                target.as_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .is_ok();
        if !mounted {
            tracing::debug!("failed to mount cgroup view for {root_name}");
            continue;
        }

        // cpu,cpuacct-style mounts also get per-controller symlinks.
        if root_name.contains(',') {
            for part in root_name.split(',') {
                let _ = std::os::unix::fs::symlink(root_name, format!("{CGROUP_ROOT}/{part}"));
            }
        }
    }
}

/// Resolve the command through PATH and exec it; the current environment
/// (already merged by the parent) rides along.
fn exec_command(commands: &[String]) -> Result<()> {
    let resolved = lookup_path(&commands[0])?;
    tracing::debug!(command = %resolved.display(), "executing container command");

    let argv: Vec<CString> = commands
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Validation("command contains a NUL byte".into()))?;
    let exe = CString::new(resolved.to_string_lossy().into_owned())
        .map_err(|_| Error::Validation("command path contains a NUL byte".into()))?;

    execv(&exe, &argv).map_err(|e| Error::kernel("execv", e))?;
    unreachable!("execv does not return on success")
}

fn lookup_path(command: &str) -> Result<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        if path.exists() {
            return Ok(path);
        }
        return Err(Error::not_found("executable", command));
    }

    let path_env = std::env::var("PATH")
        .unwrap_or_else(|_| "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into());
    for dir in path_env.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(command);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::not_found("executable", command))
}
