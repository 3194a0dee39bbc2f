//! Process liveness checks and termination.

use std::time::Duration;

use crate::errors::Result;

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Terminate a process: SIGTERM, a short grace period, then SIGKILL.
///
/// A PID that is already gone is treated as success; stop paths must be
/// idempotent.
pub fn kill_process(pid: i32) -> Result<()> {
    if !is_process_alive(pid) {
        return Ok(());
    }

    unsafe { libc::kill(pid, libc::SIGTERM) };
    std::thread::sleep(Duration::from_millis(100));

    if is_process_alive(pid) {
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
    Ok(())
}

/// Environment of a live process, read from `/proc/<pid>/environ`.
///
/// Entries are NUL-separated `key=value` strings.
pub fn process_environ(pid: i32) -> Result<Vec<(String, String)>> {
    let raw = std::fs::read(format!("/proc/{pid}/environ"))?;
    let mut envs = Vec::new();
    for entry in raw.split(|b| *b == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry = String::from_utf8_lossy(entry);
        if let Some((key, value)) = entry.split_once('=') {
            envs.push((key.to_string(), value.to_string()));
        }
    }
    Ok(envs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id() as i32));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
        // Very high PIDs are beyond the default pid_max.
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_kill_process_gone_is_ok() {
        assert!(kill_process(999_999_999).is_ok());
    }

    #[test]
    fn test_process_environ_self() {
        std::env::set_var("MYDOCKER_TEST_MARKER", "1");
        let envs = process_environ(std::process::id() as i32).unwrap();
        assert!(envs
            .iter()
            .any(|(k, v)| k == "MYDOCKER_TEST_MARKER" && v == "1"));
    }
}
