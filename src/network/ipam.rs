//! IP address management: one allocation bit per address per subnet.
//!
//! The bitmap is an ASCII "0"/"1" string keyed by subnet CIDR and persisted
//! write-through on every change. Bits 0 (network), 1 (gateway) and size-1
//! (broadcast) are never allocatable.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;

use crate::errors::{Error, Result};
use crate::store;

pub struct Ipam {
    path: PathBuf,
    subnets: BTreeMap<String, String>,
}

impl Ipam {
    pub fn open(path: PathBuf) -> Result<Self> {
        let subnets = store::load(&path)?.unwrap_or_default();
        Ok(Self { path, subnets })
    }

    fn dump(&self) -> Result<()> {
        store::dump(&self.path, &self.subnets)
    }

    /// Seed the bitmap for a subnet if this is the first time we see it.
    pub fn init_subnet(&mut self, subnet: &Ipv4Network) -> Result<()> {
        let key = subnet.to_string();
        if self.subnets.contains_key(&key) {
            return Ok(());
        }
        self.subnets.insert(key, "0".repeat(subnet.size() as usize));
        self.dump()
    }

    /// Drop a subnet's bitmap entirely (network deletion).
    pub fn forget_subnet(&mut self, subnet: &Ipv4Network) -> Result<()> {
        self.subnets.remove(&subnet.to_string());
        self.dump()
    }

    /// First-fit allocation, scanning strictly between the gateway bit and
    /// the broadcast bit.
    pub fn allocate(&mut self, subnet: &Ipv4Network) -> Result<Ipv4Addr> {
        self.init_subnet(subnet)?;

        let key = subnet.to_string();
        let bitmap = self.subnets.get(&key).expect("subnet was just seeded");
        let size = subnet.size() as usize;

        let index = bitmap
            .bytes()
            .enumerate()
            .position(|(i, bit)| i > 1 && i < size - 1 && bit == b'0')
            .ok_or_else(|| Error::SubnetExhausted(key.clone()))?;

        let bitmap = self.subnets.get_mut(&key).expect("subnet was just seeded");
        bitmap.replace_range(index..index + 1, "1");

        let ip = ip_at(subnet, index as u32);
        tracing::debug!(%ip, subnet = %key, "allocated ip address");
        self.dump()?;
        Ok(ip)
    }

    /// Clear the bit for `ip`. Releasing an already-free address is a no-op.
    pub fn release(&mut self, subnet: &Ipv4Network, ip: Ipv4Addr) -> Result<bool> {
        self.init_subnet(subnet)?;

        let key = subnet.to_string();
        let bitmap = self.subnets.get_mut(&key).expect("subnet was just seeded");

        let index = u32::from(ip).wrapping_sub(u32::from(subnet.network())) as usize;
        if index <= 1 || index >= bitmap.len() {
            return Err(Error::Network(format!("ip {ip} is outside subnet {key}")));
        }

        let was_allocated = bitmap.as_bytes()[index] == b'1';
        if was_allocated {
            bitmap.replace_range(index..index + 1, "0");
            tracing::debug!(%ip, subnet = %key, "released ip address");
            self.dump()?;
        }
        Ok(was_allocated)
    }

    /// Number of allocated addresses in a subnet.
    pub fn allocated(&self, subnet: &Ipv4Network) -> usize {
        self.subnets
            .get(&subnet.to_string())
            .map(|bitmap| bitmap.bytes().filter(|b| *b == b'1').count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn bitmap(&self, subnet: &Ipv4Network) -> Option<&str> {
        self.subnets.get(&subnet.to_string()).map(|s| s.as_str())
    }
}

/// The `index`-th address of a subnet (index 0 is the network address).
pub fn ip_at(subnet: &Ipv4Network, index: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + index)
}

/// The gateway is the first host address of the subnet.
pub fn gateway_of(subnet: &Ipv4Network) -> Ipv4Addr {
    ip_at(subnet, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(cidr: &str) -> Ipv4Network {
        cidr.parse().unwrap()
    }

    fn scratch_ipam() -> (tempfile::TempDir, Ipam) {
        let dir = tempfile::tempdir().unwrap();
        let ipam = Ipam::open(dir.path().join("ipam/subnets.json")).unwrap();
        (dir, ipam)
    }

    #[test]
    fn test_ip_at_and_gateway() {
        let net = subnet("10.20.30.0/24");
        assert_eq!(ip_at(&net, 0), "10.20.30.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(gateway_of(&net), "10.20.30.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip_at(&net, 255), "10.20.30.255".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_first_allocation_skips_reserved() {
        let (_dir, mut ipam) = scratch_ipam();
        let net = subnet("10.20.30.0/24");
        // Bits 0 (network) and 1 (gateway) are reserved.
        let ip = ipam.allocate(&net).unwrap();
        assert_eq!(ip, "10.20.30.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_allocations_are_sequential_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subnets.json");
        let net = subnet("192.168.7.0/29");

        {
            let mut ipam = Ipam::open(path.clone()).unwrap();
            assert_eq!(ipam.allocate(&net).unwrap(), ip_at(&net, 2));
            assert_eq!(ipam.allocate(&net).unwrap(), ip_at(&net, 3));
        }

        // A fresh instance sees the persisted bitmap.
        let mut ipam = Ipam::open(path).unwrap();
        assert_eq!(ipam.allocate(&net).unwrap(), ip_at(&net, 4));
        assert_eq!(ipam.allocated(&net), 3);
    }

    #[test]
    fn test_exhaustion() {
        let (_dir, mut ipam) = scratch_ipam();
        // /29 has 8 addresses, 3 reserved, 5 allocatable.
        let net = subnet("10.0.0.0/29");
        for _ in 0..5 {
            ipam.allocate(&net).unwrap();
        }
        match ipam.allocate(&net) {
            Err(Error::SubnetExhausted(_)) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(ipam.allocated(&net), 5);
    }

    #[test]
    fn test_release_restores_bitmap_bitwise() {
        let (_dir, mut ipam) = scratch_ipam();
        let net = subnet("10.0.1.0/24");
        ipam.allocate(&net).unwrap();
        let before = ipam.bitmap(&net).unwrap().to_string();

        let ip = ipam.allocate(&net).unwrap();
        assert!(ipam.release(&net, ip).unwrap());
        assert_eq!(ipam.bitmap(&net).unwrap(), before);
    }

    #[test]
    fn test_double_release_is_noop() {
        let (_dir, mut ipam) = scratch_ipam();
        let net = subnet("10.0.2.0/24");
        let ip = ipam.allocate(&net).unwrap();

        assert!(ipam.release(&net, ip).unwrap());
        assert!(!ipam.release(&net, ip).unwrap());
        assert_eq!(ipam.allocated(&net), 0);
    }

    #[test]
    fn test_release_out_of_subnet_fails() {
        let (_dir, mut ipam) = scratch_ipam();
        let net = subnet("10.0.3.0/24");
        ipam.init_subnet(&net).unwrap();

        // The gateway bit and out-of-range addresses are rejected.
        assert!(ipam.release(&net, gateway_of(&net)).is_err());
        assert!(ipam
            .release(&net, "172.16.0.5".parse().unwrap())
            .is_err());
    }

    #[test]
    fn test_allocatable_count_matches_size_minus_reserved() {
        let (_dir, mut ipam) = scratch_ipam();
        let net = subnet("10.0.4.0/28");
        let mut count = 0;
        while ipam.allocate(&net).is_ok() {
            count += 1;
        }
        assert_eq!(count as u32, net.size() - 3);
    }
}
