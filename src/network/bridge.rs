//! Bridge network driver.
//!
//! Every network of this driver is backed by a Linux bridge carrying the
//! network's name. Containers attach through veth pairs whose host side is
//! mastered by the bridge.

use std::net::IpAddr;

use super::netlink::{self, with_handle};
use super::{iptables, Endpoint, Network};
use crate::errors::{Error, Result};
use crate::util;

pub struct BridgeDriver;

impl BridgeDriver {
    /// Create the bridge if missing, assign the gateway address, bring it
    /// up and install the per-bridge iptables rules. Also used at startup
    /// to re-materialize bridges for persisted networks.
    pub fn ensure(nw: &Network) -> Result<()> {
        tracing::debug!(network = %nw.name, subnet = %nw.subnet, "ensuring bridge");

        with_handle(|handle| async move {
            let index = match netlink::link_index(&handle, &nw.name).await? {
                Some(index) => index,
                None => {
                    handle
                        .link()
                        .add()
                        .bridge(nw.name.clone())
                        .execute()
                        .await
                        .map_err(|e| netlink::netlink_err("bridge add", &nw.name, e))?;
                    netlink::link_index(&handle, &nw.name).await?.ok_or_else(|| {
                        Error::Network(format!("bridge {} vanished after creation", nw.name))
                    })?
                }
            };

            netlink::tolerate_exists(
                handle
                    .address()
                    .add(index, IpAddr::V4(nw.gateway), nw.subnet.prefix())
                    .execute()
                    .await,
            )?;

            netlink::set_link_up(&handle, index).await
        })?;

        iptables::install(&iptables::bridge_rules(
            &nw.name,
            &nw.subnet,
            &util::physical_nics(),
        ))
    }

    /// Remove the iptables rules, then the bridge link itself.
    pub fn delete(nw: &Network) -> Result<()> {
        iptables::uninstall(&iptables::bridge_rules(
            &nw.name,
            &nw.subnet,
            &util::physical_nics(),
        ))?;

        with_handle(|handle| async move {
            match netlink::link_index(&handle, &nw.name).await? {
                Some(index) => netlink::tolerate_missing(handle.link().del(index).execute().await),
                None => Ok(()),
            }
        })
    }

    /// Add the endpoint's veth pair, master the host side to the bridge and
    /// bring it up. The peer side stays down until it enters the container
    /// netns.
    pub fn connect(ep: &Endpoint) -> Result<()> {
        with_handle(|handle| async move {
            let bridge_index = netlink::link_index(&handle, &ep.network)
                .await?
                .ok_or_else(|| Error::not_found("bridge", &ep.network))?;

            handle
                .link()
                .add()
                .veth(ep.veth_host.clone(), ep.veth_peer.clone())
                .execute()
                .await
                .map_err(|e| netlink::netlink_err("veth add", &ep.veth_host, e))?;

            let host_index = netlink::link_index(&handle, &ep.veth_host)
                .await?
                .ok_or_else(|| Error::not_found("veth", &ep.veth_host))?;

            handle
                .link()
                .set(host_index)
                .master(bridge_index)
                .execute()
                .await
                .map_err(|e| netlink::netlink_err("veth master", &ep.veth_host, e))?;

            netlink::set_link_up(&handle, host_index).await
        })
    }

    /// Tear the veth pair down; deleting the host side removes the peer
    /// wherever it currently lives. Tolerates an already-deleted pair.
    pub fn disconnect(ep: &Endpoint) -> Result<()> {
        with_handle(|handle| async move {
            let Some(host_index) = netlink::link_index(&handle, &ep.veth_host).await? else {
                return Ok(());
            };
            netlink::tolerate_missing(handle.link().set(host_index).down().execute().await)?;
            netlink::tolerate_missing(handle.link().del(host_index).execute().await)
        })
    }
}
