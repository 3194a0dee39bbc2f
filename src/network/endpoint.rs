//! Endpoints: the attachment of one container to one network.
//!
//! An endpoint owns a veth pair (`veth-<8hex>` on the host bridge,
//! `ceth-<8hex>` inside the container), the container's IP on that network
//! and the published-port rules. Names are derived from
//! sha256(network-name "/" container-name), so reconnecting the same pair
//! is deterministic.

use std::collections::BTreeMap;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use super::bridge::BridgeDriver;
use super::netlink::{self, with_handle};
use super::{iptables, netns, Network};
use crate::errors::{Error, Result};
use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub uuid: String,
    pub ip: Ipv4Addr,
    /// Owning network, by name; the bridge carries the same name.
    pub network: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub veth_host: String,
    pub veth_peer: String,
    /// host-port -> container-port
    pub ports: BTreeMap<u16, u16>,
}

impl Endpoint {
    pub fn new(
        container_name: &str,
        network: &Network,
        ip: Ipv4Addr,
        ports: BTreeMap<u16, u16>,
    ) -> Self {
        let hashed = util::sha256_hex(&format!("{}/{}", network.name, container_name));
        Self {
            uuid: hashed[52..].to_string(),
            ip,
            network: network.name.clone(),
            subnet: network.subnet,
            gateway: network.gateway,
            veth_host: format!("veth-{}", &hashed[..8]),
            veth_peer: format!("ceth-{}", &hashed[..8]),
            ports,
        }
    }

    /// Wire the endpoint up to a running container:
    /// veth pair on the bridge, peer moved into the container netns and
    /// configured there, then the published-port rules.
    pub fn connect(&self, pid: i32) -> Result<()> {
        BridgeDriver::connect(self)?;
        self.move_peer_into_netns(pid)?;
        self.configure_in_netns(pid)?;
        self.install_portmaps()?;
        Ok(())
    }

    /// Undo [`connect`](Self::connect). Every step tolerates state that is
    /// already gone, so a half-torn-down endpoint can be disconnected again.
    pub fn disconnect(&self, pid: i32) -> Result<()> {
        self.remove_portmaps()?;

        if util::is_process_alive(pid) && netns::netns_path(pid).exists() {
            if let Err(e) = self.return_peer_to_host(pid) {
                tracing::debug!(endpoint = %self.uuid, "failed to move veth out of netns: {e}");
            }
        }

        BridgeDriver::disconnect(self)
    }

    fn move_peer_into_netns(&self, pid: i32) -> Result<()> {
        let ns = File::open(netns::netns_path(pid))
            .map_err(|_| Error::Network(format!("container (pid {pid}) is not running")))?;

        with_handle(|handle| async move {
            let index = netlink::link_index(&handle, &self.veth_peer)
                .await?
                .ok_or_else(|| Error::not_found("veth", &self.veth_peer))?;
            handle
                .link()
                .set(index)
                .setns_by_fd(ns.as_raw_fd())
                .execute()
                .await
                .map_err(|e| netlink::netlink_err("veth setns", &self.veth_peer, e))
        })
    }

    /// Inside the container netns: assign the endpoint IP with the subnet's
    /// mask, bring the peer and lo up, add the default route via the
    /// gateway.
    fn configure_in_netns(&self, pid: i32) -> Result<()> {
        netns::in_netns(pid, || {
            with_handle(|handle| async move {
                let index = netlink::link_index(&handle, &self.veth_peer)
                    .await?
                    .ok_or_else(|| Error::not_found("veth", &self.veth_peer))?;

                netlink::tolerate_exists(
                    handle
                        .address()
                        .add(index, IpAddr::V4(self.ip), self.subnet.prefix())
                        .execute()
                        .await,
                )?;

                netlink::set_link_up(&handle, index).await?;
                if let Some(lo) = netlink::link_index(&handle, "lo").await? {
                    netlink::set_link_up(&handle, lo).await?;
                }

                netlink::tolerate_exists(
                    handle
                        .route()
                        .add()
                        .v4()
                        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
                        .gateway(self.gateway)
                        .output_interface(index)
                        .execute()
                        .await,
                )
            })
        })
    }

    /// Inside the container netns: hand the peer veth back to the host
    /// netns (pid 1's), which also drops its addresses and routes.
    fn return_peer_to_host(&self, pid: i32) -> Result<()> {
        netns::in_netns(pid, || {
            let host_ns = File::open("/proc/1/ns/net")?;
            with_handle(|handle| async move {
                let Some(index) = netlink::link_index(&handle, &self.veth_peer).await? else {
                    return Ok(());
                };
                netlink::tolerate_missing(
                    handle
                        .link()
                        .set(index)
                        .setns_by_fd(host_ns.as_raw_fd())
                        .execute()
                        .await,
                )
            })
        })
    }

    fn install_portmaps(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Ok(());
        }
        let host_ips = util::host_ipv4s()?;
        for (out_port, in_port) in &self.ports {
            iptables::install(&iptables::portmap_rules(
                *out_port, self.ip, *in_port, &host_ips,
            ))?;
        }
        Ok(())
    }

    fn remove_portmaps(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Ok(());
        }
        let host_ips = util::host_ipv4s()?;
        for (out_port, in_port) in &self.ports {
            iptables::uninstall(&iptables::portmap_rules(
                *out_port, self.ip, *in_port, &host_ips,
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn network(name: &str, cidr: &str) -> Network {
        let subnet: Ipv4Network = cidr.parse().unwrap();
        Network {
            name: name.to_string(),
            driver: super::super::BRIDGE.to_string(),
            subnet,
            gateway: super::super::ipam::gateway_of(&subnet),
            counts: 0,
            created: Utc::now(),
        }
    }

    #[test]
    fn test_endpoint_naming_is_deterministic() {
        let nw = network("mydocker0", "10.20.30.0/24");
        let a = Endpoint::new("web", &nw, "10.20.30.2".parse().unwrap(), BTreeMap::new());
        let b = Endpoint::new("web", &nw, "10.20.30.2".parse().unwrap(), BTreeMap::new());

        assert_eq!(a.uuid, b.uuid);
        assert_eq!(a.uuid.len(), 12);
        assert_eq!(a.veth_host, b.veth_host);
        assert!(a.veth_host.starts_with("veth-"));
        assert!(a.veth_peer.starts_with("ceth-"));
        assert_eq!(&a.veth_host[5..], &a.veth_peer[5..]);
        assert_eq!(a.veth_host.len(), "veth-".len() + 8);
    }

    #[test]
    fn test_endpoint_naming_differs_per_network_and_container() {
        let nw0 = network("mydocker0", "10.20.30.0/24");
        let nw1 = network("testnet", "10.40.0.0/24");
        let ip = "10.20.30.2".parse().unwrap();

        let a = Endpoint::new("web", &nw0, ip, BTreeMap::new());
        let b = Endpoint::new("db", &nw0, ip, BTreeMap::new());
        let c = Endpoint::new("web", &nw1, ip, BTreeMap::new());

        assert_ne!(a.uuid, b.uuid);
        assert_ne!(a.uuid, c.uuid);
        assert_ne!(a.veth_host, b.veth_host);
    }

    #[test]
    fn test_endpoint_round_trip() {
        let nw = network("mydocker0", "10.20.30.0/24");
        let mut ports = BTreeMap::new();
        ports.insert(8080u16, 80u16);
        let ep = Endpoint::new("web", &nw, "10.20.30.2".parse().unwrap(), ports);

        let json = serde_json::to_string(&ep).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uuid, ep.uuid);
        assert_eq!(back.ip, ep.ip);
        assert_eq!(back.subnet, ep.subnet);
        assert_eq!(back.ports.get(&8080), Some(&80));
    }
}
