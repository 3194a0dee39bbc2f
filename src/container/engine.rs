//! The lifecycle state machine: create -> run -> stop -> restart -> delete.
//!
//! Transitions requested from a state they don't apply to are no-ops
//! (stop while stopped) or compound (restart, delete-while-running). Within
//! one container all transitions are totally ordered by the call sequence;
//! across containers nothing is promised.

use std::fs;
use std::process::Command;

use nix::sys::wait::waitpid;

use super::{parent, Container, Status};
use crate::errors::{Error, Result};
use crate::runtime::Runtime;
use crate::storage;
use crate::util;

/// `run`: drive a freshly-created container to running, then either wait
/// (foreground: the container is fully torn down and removed when its init
/// exits) or detach.
pub fn run(rt: &mut Runtime, c: &mut Container) -> Result<()> {
    start(rt, c)
}

/// `start`: no-op on a running container, full bootstrap otherwise.
pub fn start(rt: &mut Runtime, c: &mut Container) -> Result<()> {
    if c.status == Status::Running {
        return Ok(());
    }

    prepare_rootfs(rt, c)?;

    let handle = parent::spawn_init(c)?;
    c.cgroups.pid = handle.pid.as_raw();
    c.status = Status::Running;

    // Everything after the fork rolls back on failure: the child is still
    // parked on the pipe read, so it can be reaped cleanly.
    let bootstrap = (|| -> Result<()> {
        c.dump()?;
        rt.cgroups.set(&c.cgroups)?;
        rt.cgroups.apply(&c.cgroups)?;
        handle.send_commands(&c.commands)?;
        connect_endpoints(c)
    })();

    if let Err(e) = bootstrap {
        rollback_failed_start(rt, c);
        return Err(e);
    }

    if c.detach {
        return Ok(());
    }

    let _ = waitpid(nix::unistd::Pid::from_raw(c.cgroups.pid), None);
    tracing::debug!(container = %c.uuid, "init process exited");

    disconnect_endpoints(c);
    release_network_and_image(rt, c);
    rt.cgroups.destroy(&c.cgroups);
    cleanup_rootfs(c)?;
    fs::remove_dir_all(&c.rootfs.container_dir)?;
    Ok(())
}

/// `stop`: idempotent; a stopped container returns success unchanged.
pub fn stop(rt: &mut Runtime, c: &mut Container) -> Result<()> {
    if c.status != Status::Running {
        return Ok(());
    }

    // Network teardown failures must not wedge the stop path.
    disconnect_endpoints(c);

    util::kill_process(c.cgroups.pid)?;
    cleanup_rootfs(c)?;

    c.cgroups.pid = 0;
    c.status = Status::Stopped;
    c.dump()?;

    rt.cgroups.destroy(&c.cgroups);
    Ok(())
}

/// `restart`: stop if running, then start.
pub fn restart(rt: &mut Runtime, c: &mut Container) -> Result<()> {
    if c.status == Status::Running {
        stop(rt, c)?;
    }
    start(rt, c)
}

/// `delete`: stop if running, release IPs and the image refcount, remove
/// the rootfs and the record. Safe to retry after partial failures.
pub fn delete(rt: &mut Runtime, c: &mut Container) -> Result<()> {
    if c.status == Status::Running {
        stop(rt, c)?;
    }

    // An exited record already went through the failed-start unwind; its
    // addresses and refcount were released there. For everything else the
    // endpoints are detached again: when the init died behind our back the
    // stop path never ran, and the port rules would otherwise linger. Every
    // teardown step tolerates state that is already gone.
    if c.status != Status::Exited {
        disconnect_endpoints(c);
        release_network_and_image(rt, c);
    }
    cleanup_rootfs(c)?;
    if c.rootfs.container_dir.exists() {
        fs::remove_dir_all(&c.rootfs.container_dir)?;
    }
    Ok(())
}

/// `logs`: dump the detached container's log file, or follow it.
pub fn logs(c: &Container, follow: bool) -> Result<()> {
    let log_path = c.log_path();
    if follow {
        let status = Command::new("tail")
            .arg("-f")
            .arg(&log_path)
            .status()
            .map_err(|e| Error::Validation(format!("failed to run tail -f: {e}")))?;
        if !status.success() {
            return Err(Error::Validation("tail -f exited abnormally".into()));
        }
        return Ok(());
    }

    let contents = fs::read_to_string(&log_path).map_err(|e| {
        Error::Validation(format!("failed to read log {}: {e}", log_path.display()))
    })?;
    print!("{contents}");
    Ok(())
}

fn prepare_rootfs(rt: &Runtime, c: &Container) -> Result<()> {
    let driver = rt.storage_driver(&c.storage_driver)?;

    for dir in driver.dirs() {
        fs::create_dir_all(c.rootfs.container_dir.join(dir))?;
    }

    // /etc/hostname, /etc/hosts and /etc/resolv.conf are written into the
    // write layer before mounting so they are visible in the merged view.
    write_etc_files(c)?;

    driver.mount_rootfs(c)?;
    driver.mount_volume(c)?;
    Ok(())
}

fn write_etc_files(c: &Container) -> Result<()> {
    let etc = c.rootfs.write_dir.join("etc");
    fs::create_dir_all(&etc)?;

    fs::write(etc.join("hostname"), format!("{}\n", c.hostname))?;

    let mut hosts = String::from("127.0.0.1 localhost\n");
    for ep in &c.endpoints {
        hosts.push_str(&format!("{} {}\n", ep.ip, c.hostname));
    }
    fs::write(etc.join("hosts"), hosts)?;

    let mut resolv = String::new();
    for dns in &c.dns {
        resolv.push_str(&format!("nameserver {dns}\n"));
    }
    fs::write(etc.join("resolv.conf"), resolv)?;
    Ok(())
}

fn cleanup_rootfs(c: &Container) -> Result<()> {
    for inner in c.volumes.values() {
        storage::unmount(&c.volume_target(inner))?;
    }
    storage::unmount(&c.rootfs.merge_dir)
}

fn connect_endpoints(c: &Container) -> Result<()> {
    for ep in &c.endpoints {
        ep.connect(c.cgroups.pid)?;
    }
    Ok(())
}

fn disconnect_endpoints(c: &Container) {
    for ep in &c.endpoints {
        if let Err(e) = ep.disconnect(c.cgroups.pid) {
            tracing::debug!(endpoint = %ep.uuid, "failed to disconnect endpoint: {e}");
        }
    }
}

fn release_network_and_image(rt: &mut Runtime, c: &Container) {
    for ep in &c.endpoints {
        if let Err(e) = rt.networks.release_ip(&ep.network, ep.ip) {
            tracing::error!(container = %c.uuid, ip = %ep.ip, "failed to release ip: {e}");
        }
    }
    if let Err(e) = rt.images.change_counts(&c.image, -1) {
        tracing::error!(container = %c.uuid, image = %c.image, "failed to drop image refcount: {e}");
    }
}

/// Failure between cgroup apply and "running": reap the child, then unwind
/// every side effect already applied, leaving the record as exited.
fn rollback_failed_start(rt: &mut Runtime, c: &mut Container) {
    util::kill_process(c.cgroups.pid).ok();
    let _ = waitpid(nix::unistd::Pid::from_raw(c.cgroups.pid), None);

    disconnect_endpoints(c);
    release_network_and_image(rt, c);
    rt.cgroups.destroy(&c.cgroups);
    if let Err(e) = cleanup_rootfs(c) {
        tracing::error!(container = %c.uuid, "failed to unmount during rollback: {e}");
    }

    c.cgroups.pid = 0;
    c.status = Status::Exited;
    c.endpoints.clear();
    if let Err(e) = c.dump() {
        tracing::error!(container = %c.uuid, "failed to persist exited status: {e}");
    }
}

/// `network connect`: attach a running container to one more network.
pub fn connect_network(rt: &mut Runtime, c: &mut Container, network: &str) -> Result<()> {
    let pid = super::exec::require_running(c)?;
    if c.endpoints.iter().any(|ep| ep.network == network) {
        return Err(Error::Conflict(format!(
            "container {} is already connected to {network}",
            c.name
        )));
    }

    let nw = rt.networks.get(network)?.clone();
    let ip = rt.networks.allocate_ip(network)?;
    let ep = crate::network::Endpoint::new(&c.name, &nw, ip, c.ports.clone());

    if let Err(e) = ep.connect(pid) {
        let _ = rt.networks.release_ip(network, ip);
        return Err(e);
    }

    c.endpoints.push(ep);
    c.dump()
}

/// `network disconnect`: detach an endpoint and release its address.
pub fn disconnect_network(rt: &mut Runtime, c: &mut Container, network: &str) -> Result<()> {
    let index = c
        .endpoints
        .iter()
        .position(|ep| ep.network == network)
        .ok_or_else(|| {
            Error::Validation(format!(
                "container {} is not connected to {network}",
                c.name
            ))
        })?;
    let ep = c.endpoints.remove(index);

    if c.status == Status::Running {
        if let Err(e) = ep.disconnect(c.cgroups.pid) {
            tracing::debug!(endpoint = %ep.uuid, "failed to disconnect endpoint: {e}");
        }
    }
    rt.networks.release_ip(&ep.network, ep.ip)?;
    c.dump()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testutil::test_container;
    use crate::runtime::Layout;

    fn scratch_runtime() -> (tempfile::TempDir, Runtime) {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_layout(Layout::new(dir.path())).unwrap();
        (dir, rt)
    }

    #[test]
    fn test_stop_on_stopped_container_is_noop() {
        let (dir, mut rt) = scratch_runtime();
        let mut c = test_container(dir.path(), "web");
        c.status = Status::Stopped;
        c.dump().unwrap();

        stop(&mut rt, &mut c).unwrap();
        assert_eq!(c.status, Status::Stopped);
        assert_eq!(c.cgroups.pid, 0);
    }

    #[test]
    fn test_stop_on_creating_container_is_noop() {
        let (dir, mut rt) = scratch_runtime();
        let mut c = test_container(dir.path(), "web");

        stop(&mut rt, &mut c).unwrap();
        assert_eq!(c.status, Status::Creating);
    }

    #[test]
    fn test_delete_stopped_container_removes_record() {
        let (dir, mut rt) = scratch_runtime();
        let mut c = test_container(dir.path(), "web");
        c.status = Status::Stopped;
        c.dump().unwrap();
        assert!(c.config_path().exists());

        delete(&mut rt, &mut c).unwrap();
        assert!(!c.rootfs.container_dir.exists());

        // Deleting again is safe to retry.
        delete(&mut rt, &mut c).unwrap();
    }

    #[test]
    fn test_write_etc_files() {
        let (dir, _rt) = scratch_runtime();
        let mut c = test_container(dir.path(), "web");
        c.dns = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()];

        write_etc_files(&c).unwrap();

        let etc = c.rootfs.write_dir.join("etc");
        assert_eq!(
            fs::read_to_string(etc.join("hostname")).unwrap(),
            "web\n"
        );
        let resolv = fs::read_to_string(etc.join("resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
        let hosts = fs::read_to_string(etc.join("hosts")).unwrap();
        assert!(hosts.starts_with("127.0.0.1 localhost\n"));
    }

    #[test]
    fn test_logs_missing_file_is_error() {
        let (dir, _rt) = scratch_runtime();
        let c = test_container(dir.path(), "web");
        assert!(logs(&c, false).is_err());
    }
}
