//! Virtual-network manager: bridges, veth endpoints, IPAM and iptables.

pub mod bridge;
mod endpoint;
mod ipam;
pub mod iptables;
pub mod netlink;
pub mod netns;

pub use endpoint::Endpoint;
pub use ipam::{gateway_of, ip_at, Ipam};

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::runtime::Layout;
use crate::store;

pub const BRIDGE: &str = "bridge";

pub const DEFAULT_NETWORK: &str = "mydocker0";
pub const DEFAULT_SUBNET: &str = "10.20.30.0/24";

/// A named subnet backed by one bridge device of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub driver: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    /// Number of addresses handed out to containers.
    pub counts: u32,
    pub created: DateTime<Utc>,
}

impl Network {
    fn new(name: &str, driver: &str, subnet: Ipv4Network) -> Self {
        Self {
            name: name.to_string(),
            driver: driver.to_string(),
            subnet,
            gateway: gateway_of(&subnet),
            counts: 0,
            created: Utc::now(),
        }
    }
}

/// Owns the network records and the IPAM ledger. The driver set is closed:
/// bridge only.
pub struct NetworkManager {
    layout: Layout,
    drivers_dir: PathBuf,
    ipam: Ipam,
    networks: BTreeMap<String, Network>,
}

impl NetworkManager {
    pub fn new(layout: &Layout) -> Result<Self> {
        Ok(Self {
            layout: layout.clone(),
            drivers_dir: layout.networks_dir().join("drivers"),
            ipam: Ipam::open(layout.ipam_file())?,
            networks: BTreeMap::new(),
        })
    }

    /// Load every persisted network, re-materialize its kernel state, set
    /// the host forwarding invariants and make sure the default network
    /// exists.
    pub fn init(&mut self) -> Result<()> {
        iptables::setup_host_forwarding();

        for driver in [BRIDGE] {
            let driver_dir = self.drivers_dir.join(driver);
            std::fs::create_dir_all(&driver_dir)?;

            for entry in std::fs::read_dir(&driver_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(nw) = store::load::<Network>(&path)? else {
                    continue;
                };
                tracing::debug!(network = %nw.name, driver, "loaded network");
                bridge::BridgeDriver::ensure(&nw)?;
                self.networks.insert(nw.name.clone(), nw);
            }
        }

        if !self.networks.contains_key(DEFAULT_NETWORK) {
            let subnet = DEFAULT_SUBNET.parse().expect("default subnet is valid");
            self.create_network(DEFAULT_NETWORK, BRIDGE, subnet)?;
        }

        Ok(())
    }

    pub fn list(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn get(&self, name: &str) -> Result<&Network> {
        self.networks
            .get(name)
            .ok_or_else(|| Error::not_found("network", name))
    }

    /// Create a network: validate the subnet against the host's own
    /// addresses, program the bridge, seed IPAM, persist.
    pub fn create_network(
        &mut self,
        name: &str,
        driver: &str,
        subnet: Ipv4Network,
    ) -> Result<&Network> {
        if driver != BRIDGE {
            return Err(Error::Validation(format!(
                "unknown network driver {driver}; supported: {BRIDGE}"
            )));
        }
        if self.networks.contains_key(name) {
            return Err(Error::Conflict(format!("the network name {name} already exists")));
        }

        // Normalize 10.20.30.1/24 to 10.20.30.0/24.
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
            .map_err(|e| Error::Validation(format!("bad subnet: {e}")))?;

        // An overlapping subnet shows up as its gateway already living on
        // a host interface (every live network keeps the first host address
        // on its bridge).
        let gateway = gateway_of(&subnet);
        if crate::util::host_ipv4s()?.contains(&gateway) {
            return Err(Error::Conflict(format!("the subnet {subnet} already exists")));
        }

        let nw = Network::new(name, driver, subnet);
        bridge::BridgeDriver::ensure(&nw)?;
        self.ipam.init_subnet(&subnet)?;
        self.dump(&nw)?;
        Ok(self.networks.entry(nw.name.clone()).or_insert(nw))
    }

    /// Delete a network with no attached containers: drop the IPAM bitmap,
    /// tear down iptables and the bridge, remove the record.
    pub fn delete_network(&mut self, name: &str) -> Result<()> {
        let nw = self.get(name)?.clone();
        if nw.counts > 0 {
            return Err(Error::Conflict(format!(
                "there still exist {} ips in subnet {}",
                nw.counts, nw.subnet
            )));
        }

        self.ipam.forget_subnet(&nw.subnet)?;
        bridge::BridgeDriver::delete(&nw)?;

        let config = self.layout.network_config(&nw.driver, &nw.name);
        if config.exists() {
            std::fs::remove_file(config)?;
        }
        self.networks.remove(name);
        Ok(())
    }

    /// Reserve an address in the named network and bump its refcount.
    pub fn allocate_ip(&mut self, name: &str) -> Result<Ipv4Addr> {
        let subnet = self.get(name)?.subnet;
        let ip = self.ipam.allocate(&subnet)?;

        let nw = self.networks.get_mut(name).expect("checked by get above");
        nw.counts += 1;
        let nw = nw.clone();
        self.dump(&nw)?;
        Ok(ip)
    }

    /// Release an address and drop the refcount. Double release is a no-op
    /// and does not skew the count.
    pub fn release_ip(&mut self, name: &str, ip: Ipv4Addr) -> Result<()> {
        let subnet = self.get(name)?.subnet;
        let was_allocated = self.ipam.release(&subnet, ip)?;
        if !was_allocated {
            return Ok(());
        }

        let nw = self.networks.get_mut(name).expect("checked by get above");
        nw.counts = nw.counts.saturating_sub(1);
        let nw = nw.clone();
        self.dump(&nw)
    }

    fn dump(&self, nw: &Network) -> Result<()> {
        store::dump(&self.layout.network_config(&nw.driver, &nw.name), nw)
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, nw: Network) {
        self.ipam.init_subnet(&nw.subnet).unwrap();
        self.networks.insert(nw.name.clone(), nw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_manager() -> (tempfile::TempDir, NetworkManager) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let manager = NetworkManager::new(&layout).unwrap();
        (dir, manager)
    }

    fn test_network(name: &str, cidr: &str) -> Network {
        Network::new(name, BRIDGE, cidr.parse().unwrap())
    }

    #[test]
    fn test_network_record_round_trip() {
        let nw = test_network("testnet", "10.40.0.0/24");
        let json = serde_json::to_string(&nw).unwrap();
        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "testnet");
        assert_eq!(back.subnet, nw.subnet);
        assert_eq!(back.gateway, "10.40.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(back.counts, 0);
    }

    #[test]
    fn test_get_unknown_network() {
        let (_dir, manager) = scratch_manager();
        assert!(matches!(
            manager.get("nope"),
            Err(Error::NotFound { kind: "network", .. })
        ));
    }

    #[test]
    fn test_allocate_and_release_track_counts() {
        let (_dir, mut manager) = scratch_manager();
        manager.insert_for_test(test_network("testnet", "10.40.0.0/24"));

        let ip = manager.allocate_ip("testnet").unwrap();
        assert_eq!(ip, "10.40.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(manager.get("testnet").unwrap().counts, 1);

        manager.release_ip("testnet", ip).unwrap();
        assert_eq!(manager.get("testnet").unwrap().counts, 0);

        // Releasing again must not underflow the count.
        manager.release_ip("testnet", ip).unwrap();
        assert_eq!(manager.get("testnet").unwrap().counts, 0);
    }

    #[test]
    fn test_delete_network_with_allocations_fails() {
        let (_dir, mut manager) = scratch_manager();
        manager.insert_for_test(test_network("busy", "10.41.0.0/24"));
        manager.allocate_ip("busy").unwrap();

        assert!(matches!(
            manager.delete_network("busy"),
            Err(Error::Conflict(_))
        ));
    }
}
