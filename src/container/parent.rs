//! Parent half of the two-phase bootstrap.
//!
//! The parent clones a child into fresh mount/UTS/PID/net/IPC namespaces;
//! the child immediately re-execs `/proc/self/exe init` with the read end
//! of a pipe sitting at fd 3 and its working directory already inside the
//! merged rootfs. The child blocks reading that pipe until the parent has
//! finished cgroup setup and writes the command vector.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sched::{clone, CloneFlags};
use nix::unistd::{pipe, Pid};

use super::{Container, ENV_HOSTNAME};
use crate::errors::{Error, Result};

const STACK_SIZE: usize = 1024 * 1024;

/// The pipe fd the init process reads its command from.
pub const INIT_PIPE_FD: i32 = 3;

/// A spawned-but-not-yet-unblocked init process.
pub struct ParentHandle {
    pub pid: Pid,
    pipe_writer: File,
}

impl ParentHandle {
    /// Write the NUL-separated command vector and close the pipe, which
    /// unblocks the child's read.
    pub fn send_commands(self, commands: &[String]) -> Result<()> {
        let mut writer = self.pipe_writer;
        writer.write_all(commands.join("\0").as_bytes())?;
        // Dropping the writer closes the last write end; the child sees EOF.
        Ok(())
    }
}

/// Clone the in-namespace init for `c`.
///
/// Everything the child needs (argv, environment, target cwd, stdio fds) is
/// prepared before the clone; the child side only performs async-signal-safe
/// calls (`dup2`, `chdir`, `execve`) before exec.
pub fn spawn_init(c: &Container) -> Result<ParentHandle> {
    let (pipe_read, pipe_write): (OwnedFd, OwnedFd) =
        pipe().map_err(|e| Error::kernel("pipe", e))?;

    let log_file = if c.detach {
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(c.log_path())?,
        )
    } else {
        None
    };

    let exe = CString::new("/proc/self/exe").expect("no interior nul");
    let argv = [
        CString::new(super::MYDOCKER).expect("no interior nul"),
        CString::new("init").expect("no interior nul"),
    ];
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let envp = build_env(c)?;
    let envp_ptrs: Vec<*const libc::c_char> = envp
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    let cwd = CString::new(c.rootfs.merge_dir.to_string_lossy().into_owned())
        .map_err(|_| Error::Validation("merge dir contains a NUL byte".into()))?;

    let pipe_read_fd = pipe_read.as_raw_fd();
    let log_fd = log_file.as_ref().map(|f| f.as_raw_fd());

    let child = Box::new(move || -> isize {
        unsafe {
            if libc::dup2(pipe_read_fd, INIT_PIPE_FD) < 0 {
                return -1;
            }
            if let Some(log_fd) = log_fd {
                if libc::dup2(log_fd, libc::STDOUT_FILENO) < 0
                    || libc::dup2(log_fd, libc::STDERR_FILENO) < 0
                {
                    return -1;
                }
            }
            if libc::chdir(cwd.as_ptr()) < 0 {
                return -1;
            }
            libc::execve(exe.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
        }
        // execve only returns on failure.
        -1
    });

    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC;

    let mut stack = vec![0u8; STACK_SIZE];
    let pid = unsafe { clone(child, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| Error::kernel("clone", e))?;

    // The read end belongs to the child now.
    drop(pipe_read);
    tracing::debug!(container = %c.uuid, pid = pid.as_raw(), "spawned init process");

    Ok(ParentHandle {
        pid,
        pipe_writer: File::from(pipe_write),
    })
}

/// The child's environment: ours, plus the container's `-e` variables, plus
/// the hostname for init to apply. Container variables win over inherited
/// ones; getenv stops at the first match.
fn build_env(c: &Container) -> Result<Vec<CString>> {
    let mut merged: std::collections::BTreeMap<String, String> = std::env::vars().collect();
    for (key, value) in &c.envs {
        merged.insert(key.clone(), value.clone());
    }
    merged.insert(ENV_HOSTNAME.to_string(), c.hostname.clone());

    merged
        .iter()
        .map(|(key, value)| entry(key, value))
        .collect()
}

fn entry(key: &str, value: &str) -> Result<CString> {
    CString::new(format!("{key}={value}"))
        .map_err(|_| Error::Validation(format!("environment entry {key} contains a NUL byte")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_carries_container_vars_and_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = crate::container::testutil::test_container(dir.path(), "web");
        c.envs.insert("APP_MODE".into(), "prod".into());

        let envp = build_env(&c).unwrap();
        let as_strings: Vec<String> = envp
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();

        assert!(as_strings.contains(&"APP_MODE=prod".to_string()));
        assert!(as_strings.contains(&format!("{ENV_HOSTNAME}=web")));
    }

    #[test]
    fn test_command_framing_is_nul_separated() {
        let commands = vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        let framed = commands.join("\0");
        let back: Vec<&str> = framed.split('\0').collect();
        assert_eq!(back, vec!["sh", "-c", "echo hi"]);
    }
}
