//! Small host-side helpers shared across subsystems.

mod names;
mod process;

pub use names::random_name;
pub use process::{is_process_alive, kill_process, process_environ};

use std::net::Ipv4Addr;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::Result;

/// Hex-encoded sha256 of `input` (64 lowercase hex chars).
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Whether `target` is currently a mount point, according to `/proc/mounts`.
pub fn is_mounted(target: &Path) -> bool {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let target = target.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mnt| mnt == target)
}

/// Whether the kernel can mount filesystems of type `fstype`, either because
/// the module is loaded or the filesystem is built in.
pub fn fs_supported(fstype: &str) -> bool {
    if let Ok(filesystems) = std::fs::read_to_string("/proc/filesystems") {
        if filesystems
            .lines()
            .any(|line| line.split_whitespace().next_back() == Some(fstype))
        {
            return true;
        }
    }
    match std::fs::read_to_string("/proc/modules") {
        Ok(modules) => modules
            .lines()
            .any(|line| line.split_whitespace().next() == Some(fstype)),
        Err(_) => false,
    }
}

/// All IPv4 addresses assigned to host interfaces, loopback excluded.
pub fn host_ipv4s() -> Result<Vec<Ipv4Addr>> {
    let mut ips = Vec::new();
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| crate::errors::Error::kernel("getifaddrs", e))?;
    for ifaddr in addrs {
        if ifaddr.interface_name == "lo" {
            continue;
        }
        if let Some(addr) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            ips.push(addr.ip());
        }
    }
    Ok(ips)
}

/// Physical NICs: entries under `/sys/class/net` backed by a real device
/// (bridges and veths have no `device` link).
pub fn physical_nics() -> Vec<String> {
    let mut nics = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return nics;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        if entry.path().join("device").exists() {
            nics.push(name);
        }
    }
    nics.sort();
    nics
}

/// Render a byte count the way `docker images` does (e.g. "5.6MB").
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[unit])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_stable() {
        // Known vector: sha256("mydocker0") prefix feeds the iptables mark.
        let sum = sha256_hex("mydocker0");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sum, sha256_hex("mydocker0"));
        assert_ne!(sum, sha256_hex("mydocker1"));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1500), "1.5KB");
        assert_eq!(human_size(5_600_000), "5.6MB");
        assert_eq!(human_size(2_000_000_000), "2.0GB");
    }

    #[test]
    fn test_is_mounted_root() {
        // "/" is always a mount point, an arbitrary scratch path never is.
        assert!(is_mounted(Path::new("/")));
        assert!(!is_mounted(Path::new("/definitely/not/a/mountpoint")));
    }

    #[test]
    fn test_fs_supported_proc() {
        assert!(fs_supported("proc"));
        assert!(!fs_supported("no-such-filesystem"));
    }
}
