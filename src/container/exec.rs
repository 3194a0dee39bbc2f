//! `exec`: run a command inside a running container.
//!
//! The CLI side re-execs `/proc/self/exe exec` with the target carried in
//! environment variables; the helper side joins the container's cgroups,
//! enters its namespaces with setns and runs the command. The helper hook
//! runs before any argument parsing, mirroring a constructor in a lower
//! level language.

use std::fs::File;
use std::os::fd::AsFd;
use std::process::Command;

use nix::sched::{setns, CloneFlags};

use super::{scan, Container, Status};
use crate::cgroups::{hierarchy, CgroupManager};
use crate::errors::{Error, Result};
use crate::runtime::Runtime;
use crate::util;

pub const ENV_EXEC_PID: &str = "mydocker_pid";
pub const ENV_EXEC_CMD: &str = "mydocker_cmd";
pub const ENV_CGROUP_PATH: &str = "mydocker_cgroup_path";

/// The namespaces joined, in order; mnt last so /proc stays readable while
/// the others are opened.
const NAMESPACES: [&str; 5] = ["ipc", "uts", "net", "pid", "mnt"];

/// CLI side: resolve the container and re-exec the helper.
pub fn exec_in_container(rt: &Runtime, identifier: &str, commands: &[String]) -> Result<i32> {
    let c = scan::get_container(&rt.layout, identifier)?;
    if c.status != Status::Running {
        return Err(Error::Validation(format!(
            "the container {identifier} is {}, not running",
            c.status
        )));
    }

    let cmd_str = shell_join(commands);
    tracing::debug!(container = %c.uuid, pid = c.pid(), command = %cmd_str, "exec");

    let mut helper = Command::new("/proc/self/exe");
    helper
        .arg("exec")
        .env(ENV_EXEC_PID, c.pid().to_string())
        .env(ENV_EXEC_CMD, &cmd_str)
        .env(ENV_CGROUP_PATH, &c.cgroups.path);

    // The exec'd command sees the container's environment, not ours.
    for (key, value) in util::process_environ(c.pid())? {
        helper.env(key, value);
    }

    let status = helper
        .status()
        .map_err(|e| Error::Validation(format!("failed to re-exec helper: {e}")))?;
    Ok(status.code().unwrap_or(1))
}

/// Helper side. Must be called before CLI parsing; does nothing unless the
/// exec environment is present, and never returns when it is.
pub fn maybe_enter_namespace() -> Result<()> {
    let (Ok(pid), Ok(cmd)) = (std::env::var(ENV_EXEC_PID), std::env::var(ENV_EXEC_CMD)) else {
        return Ok(());
    };
    let pid: i32 = pid
        .parse()
        .map_err(|_| Error::Validation(format!("bad {ENV_EXEC_PID}: {pid:?}")))?;
    let cgroup_path = std::env::var(ENV_CGROUP_PATH).unwrap_or_default();

    // Join the container's cgroups first so the exec'd process is
    // accounted like any other container process.
    if !cgroup_path.is_empty() {
        join_cgroups(&cgroup_path)?;
    }

    let handles: Vec<(&str, File)> = NAMESPACES
        .iter()
        .map(|ns| {
            File::open(format!("/proc/{pid}/ns/{ns}"))
                .map(|f| (*ns, f))
                .map_err(|e| Error::Validation(format!("failed to open ns {ns} of {pid}: {e}")))
        })
        .collect::<Result<_>>()?;

    for (ns, handle) in &handles {
        setns(handle.as_fd(), CloneFlags::empty()).map_err(|e| {
            tracing::warn!("failed to setns on {ns} namespace: {e}");
            Error::kernel("setns", e)
        })?;
    }

    // Forked children land in the joined pid namespace; exec through the
    // shell so the command string behaves like `system(3)`.
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(&cmd)
        .status()
        .map_err(|e| Error::Validation(format!("failed to run {cmd:?}: {e}")))?;
    std::process::exit(status.code().unwrap_or(1));
}

fn join_cgroups(cgroup_path: &str) -> Result<()> {
    let my_pid = std::process::id() as i32;
    let manager = CgroupManager::new();
    for subsystem in manager.subsystems() {
        if !hierarchy::subsystem_mounted(subsystem.root_name()) {
            continue;
        }
        if let Err(e) = hierarchy::apply(subsystem.root_name(), cgroup_path, my_pid) {
            tracing::warn!("failed to join {} cgroup: {e}", subsystem.name());
        }
    }
    Ok(())
}

/// Join argv back into one shell line, single-quoting any argument with
/// whitespace.
fn shell_join(commands: &[String]) -> String {
    commands
        .iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("'{arg}'")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Used by `network connect` to wire a new endpoint into a live container.
pub fn require_running(c: &Container) -> Result<i32> {
    if c.status != Status::Running || !util::is_process_alive(c.pid()) {
        return Err(Error::Validation(format!(
            "the container {} is not running",
            c.name
        )));
    }
    Ok(c.pid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_spaced_args() {
        let commands = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo a b".to_string(),
        ];
        assert_eq!(shell_join(&commands), "sh -c 'echo a b'");
    }

    #[test]
    fn test_maybe_enter_namespace_without_env_is_noop() {
        // No exec environment in the test runner.
        assert!(maybe_enter_namespace().is_ok());
    }

    #[test]
    fn test_namespace_order_ends_with_mnt() {
        assert_eq!(NAMESPACES.last(), Some(&"mnt"));
    }
}
