//! The iptables NAT/filter plane.
//!
//! Rules come in two families: per-bridge rules (masquerade plus the
//! mark+drop pattern that stops cross-bridge leakage) and per-published-port
//! rules (DNAT/SNAT covering external, loopback and host-IP access paths).
//! The chain is process-wide shared state, so every insert is guarded by a
//! `-C` existence check and every delete likewise.

use std::net::Ipv4Addr;
use std::process::Command;

use ipnetwork::Ipv4Network;

use crate::errors::{Error, Result};
use crate::util;

/// One iptables rule: table plus the full rule spec (without `-A`/`-D`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn run(&self, action: &str) -> Result<bool> {
        let status = Command::new("iptables")
            .arg("-t")
            .arg(self.table)
            .arg(action)
            .args(&self.spec)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map_err(|e| Error::Network(format!("failed to run iptables: {e}")))?;
        Ok(status.success())
    }

    pub fn exists(&self) -> Result<bool> {
        self.run("-C")
    }

    /// Append the rule unless it is already present.
    pub fn ensure(&self) -> Result<()> {
        if self.exists()? {
            return Ok(());
        }
        if !self.run("-A")? {
            return Err(Error::Network(format!(
                "failed to set iptables rule -t {} {:?}",
                self.table, self.spec
            )));
        }
        Ok(())
    }

    /// Delete the rule if present; absent rules are a no-op.
    pub fn remove(&self) -> Result<()> {
        if !self.exists()? {
            return Ok(());
        }
        if !self.run("-D")? {
            return Err(Error::Network(format!(
                "failed to del iptables rule -t {} {:?}",
                self.table, self.spec
            )));
        }
        Ok(())
    }
}

/// The packet mark of a bridge: the first 8 hex chars of sha256(name),
/// read as a hexadecimal u32.
pub fn bridge_mark(bridge: &str) -> String {
    format!("0x{}", &util::sha256_hex(bridge)[..8])
}

/// The rule set carried by one bridge.
///
/// - nat POSTROUTING: masquerade traffic leaving the subnet
/// - mangle PREROUTING: mark everything entering from the bridge
/// - mangle POSTROUTING: accept marked packets out of each physical NIC,
///   then drop marked packets leaving through anything but this bridge
pub fn bridge_rules(bridge: &str, subnet: &Ipv4Network, phys_nics: &[String]) -> Vec<Rule> {
    let subnet = subnet.to_string();
    let mark = bridge_mark(bridge);

    let mut rules = vec![
        Rule::new(
            "nat",
            &[
                "POSTROUTING", "-s", &subnet, "!", "-o", bridge, "-j", "MASQUERADE",
            ],
        ),
        Rule::new(
            "mangle",
            &[
                "PREROUTING", "-i", bridge, "-j", "MARK", "--set-mark", &mark,
            ],
        ),
    ];

    for nic in phys_nics {
        rules.push(Rule::new(
            "mangle",
            &[
                "POSTROUTING", "-o", nic, "-m", "mark", "--mark", &mark, "-j", "ACCEPT",
            ],
        ));
    }

    rules.push(Rule::new(
        "mangle",
        &[
            "POSTROUTING", "!", "-o", bridge, "-m", "mark", "--mark", &mark, "-j", "DROP",
        ],
    ));

    rules
}

/// The rule set for one published port (host `out_port` to
/// `in_ip:in_port`), covering every access path:
///
/// 1. external clients (DNAT in PREROUTING, loopback excluded)
/// 2. `127.0.0.1:out` on the host (DNAT in OUTPUT...)
/// 3. ...plus the SNAT return path through the first host address
/// 4. `<host-ip>:out` for each host address (DNAT in OUTPUT)
pub fn portmap_rules(
    out_port: u16,
    in_ip: Ipv4Addr,
    in_port: u16,
    host_ips: &[Ipv4Addr],
) -> Vec<Rule> {
    let out_port = out_port.to_string();
    let in_port = in_port.to_string();
    let dest = format!("{in_ip}:{in_port}");
    let in_ip = in_ip.to_string();

    let mut rules = vec![
        Rule::new(
            "nat",
            &[
                "PREROUTING", "!", "-s", "127.0.0.1", "!", "-d", "127.0.0.1", "-p", "tcp", "-m",
                "tcp", "--dport", &out_port, "-j", "DNAT", "--to-destination", &dest,
            ],
        ),
        Rule::new(
            "nat",
            &[
                "OUTPUT", "-d", "127.0.0.1", "-p", "tcp", "-m", "tcp", "--dport", &out_port, "-j",
                "DNAT", "--to-destination", &dest,
            ],
        ),
    ];

    if let Some(first) = host_ips.first() {
        // A loopback-originated packet DNAT'd to the container would come
        // back with an unroutable 127.0.0.1 source; SNAT it to a real
        // host address so the container can answer.
        rules.push(Rule::new(
            "nat",
            &[
                "POSTROUTING", "-s", "127.0.0.1", "-d", &in_ip, "-p", "tcp", "-m", "tcp",
                "--dport", &in_port, "-j", "SNAT", "--to-source", &first.to_string(),
            ],
        ));
    }

    for host_ip in host_ips {
        rules.push(Rule::new(
            "nat",
            &[
                "OUTPUT", "-d", &host_ip.to_string(), "-p", "tcp", "-m", "tcp", "--dport",
                &out_port, "-j", "DNAT", "--to-destination", &dest,
            ],
        ));
    }

    rules
}

pub fn install(rules: &[Rule]) -> Result<()> {
    for rule in rules {
        rule.ensure()?;
    }
    Ok(())
}

pub fn uninstall(rules: &[Rule]) -> Result<()> {
    for rule in rules {
        rule.remove()?;
    }
    Ok(())
}

/// Host-wide kernel settings the NAT plane depends on. Docker 1.13+ flipped
/// the FORWARD chain policy to DROP, so it is forced back to ACCEPT here.
pub fn setup_host_forwarding() {
    let sysctls = [
        "net.ipv4.ip_forward=1",
        "net.ipv4.conf.all.route_localnet=1",
        "net.bridge.bridge-nf-call-iptables=1",
    ];
    for sysctl in sysctls {
        let ok = Command::new("sysctl")
            .arg("-w")
            .arg(sysctl)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            tracing::warn!("failed to set {sysctl}");
        }
    }

    let ok = Command::new("iptables")
        .args(["-P", "FORWARD", "ACCEPT"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !ok {
        tracing::warn!("failed to set iptables FORWARD policy to ACCEPT");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(cidr: &str) -> Ipv4Network {
        cidr.parse().unwrap()
    }

    #[test]
    fn test_bridge_mark_is_hex_u32() {
        let mark = bridge_mark("mydocker0");
        assert!(mark.starts_with("0x"));
        assert_eq!(mark.len(), 10);
        assert!(u32::from_str_radix(&mark[2..], 16).is_ok());
        assert_eq!(mark, bridge_mark("mydocker0"));
    }

    #[test]
    fn test_bridge_rules_shape() {
        let nics = vec!["eth0".to_string(), "eth1".to_string()];
        let rules = bridge_rules("testnet", &subnet("10.20.30.0/24"), &nics);

        // masquerade + mark + one accept per NIC + drop
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[0].table, "nat");
        assert_eq!(
            rules[0].spec,
            vec![
                "POSTROUTING", "-s", "10.20.30.0/24", "!", "-o", "testnet", "-j", "MASQUERADE"
            ]
        );
        assert_eq!(rules[1].table, "mangle");
        assert!(rules[1].spec.contains(&"MARK".to_string()));
        assert!(rules[2].spec.contains(&"eth0".to_string()));
        assert!(rules[3].spec.contains(&"eth1".to_string()));
        assert_eq!(rules[4].spec.last().unwrap(), "DROP");
        // The drop rule applies to everything that did not leave via the bridge.
        assert_eq!(&rules[4].spec[..3], &["POSTROUTING", "!", "-o"]);
    }

    #[test]
    fn test_portmap_rules_shape() {
        let host_ips = vec!["192.168.138.179".parse().unwrap()];
        let rules = portmap_rules(8080, "10.20.30.2".parse().unwrap(), 80, &host_ips);

        // external DNAT + loopback DNAT + SNAT return + one host-IP DNAT
        assert_eq!(rules.len(), 4);
        assert!(rules.iter().all(|r| r.table == "nat"));

        assert_eq!(rules[0].spec[0], "PREROUTING");
        assert!(rules[0].spec.contains(&"10.20.30.2:80".to_string()));
        assert!(rules[0].spec.contains(&"8080".to_string()));

        assert_eq!(rules[1].spec[0], "OUTPUT");
        assert!(rules[1].spec.contains(&"127.0.0.1".to_string()));

        assert_eq!(rules[2].spec[0], "POSTROUTING");
        assert!(rules[2].spec.contains(&"SNAT".to_string()));
        assert!(rules[2].spec.contains(&"192.168.138.179".to_string()));

        assert_eq!(rules[3].spec[0], "OUTPUT");
        assert!(rules[3].spec.contains(&"192.168.138.179".to_string()));
    }

    #[test]
    fn test_portmap_rules_one_dnat_per_host_ip() {
        let host_ips: Vec<Ipv4Addr> = vec![
            "192.168.1.10".parse().unwrap(),
            "10.0.0.10".parse().unwrap(),
        ];
        let rules = portmap_rules(8000, "10.20.30.5".parse().unwrap(), 80, &host_ips);
        assert_eq!(rules.len(), 5);
    }

    #[test]
    fn test_portmap_ordering_is_host_to_container() {
        // -p 8080:80 publishes host 8080 -> container 80.
        let rules = portmap_rules(8080, "10.1.1.2".parse().unwrap(), 80, &[]);
        let prerouting = &rules[0].spec;
        let dport_pos = prerouting.iter().position(|a| a == "--dport").unwrap();
        assert_eq!(prerouting[dport_pos + 1], "8080");
        assert!(prerouting.contains(&"10.1.1.2:80".to_string()));
    }
}
