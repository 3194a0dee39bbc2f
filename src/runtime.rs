//! Runtime context: on-disk layout plus the registries every operation needs.
//!
//! The registries (storage drivers, cgroup subsystems, networks, IPAM) are
//! closed sets, but they are *not* globals: a [`Runtime`] is built once at
//! startup and threaded through by reference.

use std::path::{Path, PathBuf};

use crate::cgroups::CgroupManager;
use crate::errors::{Error, Result};
use crate::image::ImageStore;
use crate::network::NetworkManager;
use crate::storage::{self, StorageDriver};

pub const DEFAULT_ROOT: &str = "/var/lib/mydocker";
pub const ROOT_ENV: &str = "MYDOCKER_ROOT";

pub const CONFIG_NAME: &str = "config.json";
pub const LOG_NAME: &str = "container.log";

/// All paths under the runtime root, derived in one place.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `MYDOCKER_ROOT`, falling back to `/var/lib/mydocker`.
    pub fn from_env() -> Self {
        match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::new(PathBuf::from(root)),
            _ => Self::new(DEFAULT_ROOT),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn container_dir(&self, uuid: &str) -> PathBuf {
        self.containers_dir().join(uuid)
    }

    pub fn container_config(&self, uuid: &str) -> PathBuf {
        self.container_dir(uuid).join(CONFIG_NAME)
    }

    pub fn container_log(&self, uuid: &str) -> PathBuf {
        self.container_dir(uuid).join(LOG_NAME)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn image_root(&self, uuid: &str) -> PathBuf {
        self.images_dir().join(uuid)
    }

    pub fn image_catalog(&self) -> PathBuf {
        self.images_dir().join("repositories.json")
    }

    pub fn networks_dir(&self) -> PathBuf {
        self.root.join("networks")
    }

    pub fn network_driver_dir(&self, driver: &str) -> PathBuf {
        self.networks_dir().join("drivers").join(driver)
    }

    pub fn network_config(&self, driver: &str, name: &str) -> PathBuf {
        self.network_driver_dir(driver).join(format!("{name}.json"))
    }

    pub fn ipam_file(&self) -> PathBuf {
        self.networks_dir().join("ipam").join("subnets.json")
    }
}

/// Everything a command needs: layout, drivers, subsystems, networks, images.
pub struct Runtime {
    pub layout: Layout,
    pub cgroups: CgroupManager,
    pub networks: NetworkManager,
    pub images: ImageStore,
    storage_drivers: Vec<Box<dyn StorageDriver>>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_layout(Layout::from_env())
    }

    pub fn with_layout(layout: Layout) -> Result<Self> {
        let networks = NetworkManager::new(&layout)?;
        let images = ImageStore::open(&layout)?;
        Ok(Self {
            layout,
            cgroups: CgroupManager::new(),
            networks,
            images,
            storage_drivers: storage::registry(),
        })
    }

    /// Look up a storage driver by tag; the set is closed at compile time.
    pub fn storage_driver(&self, name: &str) -> Result<&dyn StorageDriver> {
        self.storage_drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown storage driver {name}; supported: {}",
                    self.storage_drivers
                        .iter()
                        .map(|d| d.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/var/lib/mydocker");
        assert_eq!(
            layout.container_config("0123456789ab"),
            PathBuf::from("/var/lib/mydocker/containers/0123456789ab/config.json")
        );
        assert_eq!(
            layout.network_config("bridge", "mydocker0"),
            PathBuf::from("/var/lib/mydocker/networks/drivers/bridge/mydocker0.json")
        );
        assert_eq!(
            layout.ipam_file(),
            PathBuf::from("/var/lib/mydocker/networks/ipam/subnets.json")
        );
        assert_eq!(
            layout.image_catalog(),
            PathBuf::from("/var/lib/mydocker/images/repositories.json")
        );
    }
}
