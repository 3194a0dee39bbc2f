//! Container records and the lifecycle machinery around them.

pub mod engine;
pub mod exec;
pub mod init;
mod new;
pub mod parent;
pub mod scan;

pub use new::{new_container, parse_port_mapping, RunSpec};

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cgroups::Cgroups;
use crate::errors::Result;
use crate::network::Endpoint;
use crate::runtime::CONFIG_NAME;
use crate::store;

pub const MYDOCKER: &str = "mydocker";

/// Hostname handed to the in-namespace init through its environment.
pub const ENV_HOSTNAME: &str = "mydocker_hostname";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Running,
    Stopped,
    Exited,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Where a container's filesystem layers live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rootfs {
    pub container_dir: PathBuf,
    /// The image's materialized rootfs, shared read-only.
    pub image_dir: PathBuf,
    pub write_dir: PathBuf,
    pub merge_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub detach: bool,
    pub uuid: String,
    pub name: String,
    pub hostname: String,
    pub dns: Vec<String>,
    pub image: String,
    pub commands: Vec<String>,
    pub status: Status,
    pub storage_driver: String,
    pub rootfs: Rootfs,
    /// host path -> path inside the container
    pub volumes: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    /// host port -> container port
    pub ports: BTreeMap<u16, u16>,
    pub endpoints: Vec<Endpoint>,
    pub cgroups: Cgroups,
    pub created: DateTime<Utc>,
}

impl Container {
    pub fn pid(&self) -> i32 {
        self.cgroups.pid
    }

    pub fn config_path(&self) -> PathBuf {
        self.rootfs.container_dir.join(CONFIG_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.rootfs.container_dir.join(crate::runtime::LOG_NAME)
    }

    /// Where a volume's in-container path lands under the merged rootfs.
    pub fn volume_target(&self, inner: &str) -> PathBuf {
        self.rootfs.merge_dir.join(inner.trim_start_matches('/'))
    }

    /// Persist the record; a full-file truncating write.
    pub fn dump(&self) -> Result<()> {
        store::dump(&self.config_path(), self)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::cgroups::Resources;

    /// A minimal record for unit tests; nothing here touches the kernel.
    pub fn test_container(root: &std::path::Path, name: &str) -> Container {
        let uuid = crate::util::sha256_hex(name)[..12].to_string();
        let container_dir = root.join("containers").join(&uuid);
        Container {
            detach: false,
            uuid: uuid.clone(),
            name: name.to_string(),
            hostname: name.to_string(),
            dns: vec!["8.8.8.8".to_string()],
            image: "busybox:latest".to_string(),
            commands: vec!["sh".to_string()],
            status: Status::Creating,
            storage_driver: crate::storage::OVERLAY.to_string(),
            rootfs: Rootfs {
                container_dir: container_dir.clone(),
                image_dir: root.join("images/3f57d9401f8d"),
                write_dir: container_dir.join("diff"),
                merge_dir: container_dir.join("merged"),
            },
            volumes: BTreeMap::new(),
            envs: BTreeMap::new(),
            ports: BTreeMap::new(),
            endpoints: Vec::new(),
            cgroups: Cgroups::new(format!("{MYDOCKER}/{uuid}"), Resources::default()),
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Running).unwrap(), "\"running\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"stopped\"").unwrap(),
            Status::Stopped
        );
        assert_eq!(Status::Exited.to_string(), "exited");
    }

    #[test]
    fn test_container_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = testutil::test_container(dir.path(), "web");
        c.envs.insert("TERM".into(), "xterm".into());
        c.ports.insert(8080, 80);
        c.volumes.insert("/srv/data".into(), "/data".into());

        let json = serde_json::to_string(&c).unwrap();
        let back: Container = serde_json::from_str(&json).unwrap();

        assert_eq!(back.uuid, c.uuid);
        assert_eq!(back.status, Status::Creating);
        assert_eq!(back.ports, c.ports);
        assert_eq!(back.volumes, c.volumes);
        assert_eq!(back.envs, c.envs);
        assert_eq!(back.cgroups.path, c.cgroups.path);
    }

    #[test]
    fn test_uuid_is_name_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let c = testutil::test_container(dir.path(), "web");
        assert_eq!(c.uuid.len(), 12);
        assert_eq!(c.uuid, crate::util::sha256_hex("web")[..12]);
        assert!(c.uuid.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_volume_target_under_merge_dir() {
        let dir = tempfile::tempdir().unwrap();
        let c = testutil::test_container(dir.path(), "web");
        assert_eq!(c.volume_target("/data"), c.rootfs.merge_dir.join("data"));
    }

    #[test]
    fn test_dump_writes_config_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let c = testutil::test_container(dir.path(), "web");
        c.dump().unwrap();

        let loaded: Container = store::load(&c.config_path()).unwrap().unwrap();
        assert_eq!(loaded.name, "web");
    }
}
