//! Network-namespace traversal.
//!
//! Changing the current netns is a per-OS-thread operation; doing it on a
//! shared thread would corrupt every other task scheduled there. Each
//! traversal therefore runs on its own scoped thread: enter the target
//! netns, run the closure, restore the original netns before the thread
//! ends. Netlink sessions opened inside the closure are created on that
//! same thread, so they talk to the entered namespace.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;

use nix::sched::{setns, CloneFlags};

use crate::errors::{Error, Result};

/// `/proc/<pid>/ns/net` of a container's init process.
pub fn netns_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Run `f` with the current thread inside the netns of `pid`.
///
/// The closure observes the container's links, routes and sockets; the
/// calling thread is never switched.
pub fn in_netns<T, F>(pid: i32, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    let target = netns_path(pid);

    std::thread::scope(|scope| {
        scope
            .spawn(move || -> Result<T> {
                let host_ns = File::open("/proc/self/ns/net")?;
                let container_ns = File::open(&target).map_err(|e| {
                    Error::Network(format!("failed to open {}: {e}", target.display()))
                })?;

                setns(container_ns.as_fd(), CloneFlags::CLONE_NEWNET)
                    .map_err(|e| Error::kernel("setns", e))?;

                let out = f();

                // Always restore, even when the closure failed; the scoped
                // thread dies right after, but a stray panic handler must
                // not run in the wrong namespace.
                setns(host_ns.as_fd(), CloneFlags::CLONE_NEWNET)
                    .map_err(|e| Error::kernel("setns", e))?;

                out
            })
            .join()
            .map_err(|_| Error::Network("netns worker thread panicked".into()))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netns_path_shape() {
        assert_eq!(netns_path(42), PathBuf::from("/proc/42/ns/net"));
    }

    #[test]
    fn test_in_netns_missing_pid_fails_cleanly() {
        let result = in_netns(999_999_999, || Ok(()));
        assert!(result.is_err());
    }
}
