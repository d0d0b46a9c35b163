//! LLDP discovery through `lldpctl` and SNMP.
//!
//! The server's own neighbours come from the local LLDP agent
//! (`lldpctl -f keyvalue`). Switch neighbour tables are read from the
//! LLDP-MIB remote tables with `snmpwalk`:
//!
//! ```text
//! lldpRemChassisId        .1.0.8802.1.1.2.1.4.1.1.5.<timemark>.<port>.<index> = <mac>
//! lldpRemManAddrIfSubtype .1.0.8802.1.1.2.1.4.2.1.3.<timemark>.<port>.<index>.1.4.<a.b.c.d> = <n>
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};
use walt_common::{MacAddress, TopologyConfig};

use crate::discovery::{
    DiscoveryHost, DiscoveryOutcome, NeighborDiscovery, NeighborInfo, PortNeighbors,
};
use crate::shell::{self, shellquote, LLDPCLI_CMD, LLDPCTL_CMD, SNMPWALK_CMD};

/// lldpRemoteData subtree, covering both tables below
const LLDP_REM_DATA_OID: &str = ".1.0.8802.1.1.2.1.4";
const LLDP_REM_CHASSIS_ID_OID: &str = ".1.0.8802.1.1.2.1.4.1.1.5.";
const LLDP_REM_MAN_ADDR_OID: &str = ".1.0.8802.1.1.2.1.4.2.1.3.";

/// IANA address family number of IPv4, as used in lldpRemManAddrSubtype
const ADDR_FAMILY_IPV4: u32 = 1;

/// Production discovery backend.
#[derive(Debug, Clone)]
pub struct LldpBackend {
    snmp_community: String,
    /// Only neighbours seen on this interface are reported for the server
    server_interface: Option<String>,
}

impl LldpBackend {
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            snmp_community: config.snmp_community.clone(),
            server_interface: Some(config.server_interface.clone()).filter(|i| !i.is_empty()),
        }
    }

    async fn query_local(&self) -> DiscoveryOutcome {
        let cmd = format!("{LLDPCTL_CMD} -f keyvalue");
        match shell::exec(&cmd).await {
            Ok(result) if result.success() => {
                parse_lldpctl_keyvalue(&result.stdout, self.server_interface.as_deref())
            }
            Ok(result) => DiscoveryOutcome::Fatal {
                reason: format!("{LLDPCTL_CMD} failed with {}", result.failure_reason()),
            },
            Err(e) => DiscoveryOutcome::Fatal {
                reason: e.to_string(),
            },
        }
    }

    async fn query_switch(&self, ip: IpAddr) -> DiscoveryOutcome {
        let cmd = format!(
            "{SNMPWALK_CMD} -v2c -c {} -On -Oq {} {LLDP_REM_DATA_OID}",
            shellquote(&self.snmp_community),
            shellquote(&ip.to_string())
        );
        match shell::exec(&cmd).await {
            Ok(result) if result.success() => parse_snmp_remote_table(&result.stdout),
            Ok(result) => DiscoveryOutcome::Fatal {
                reason: format!("{SNMPWALK_CMD} failed with {}", result.failure_reason()),
            },
            Err(e) => DiscoveryOutcome::Fatal {
                reason: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl NeighborDiscovery for LldpBackend {
    async fn query(&self, host: DiscoveryHost) -> DiscoveryOutcome {
        let outcome = match host {
            DiscoveryHost::Local => self.query_local().await,
            DiscoveryHost::Switch { ip } => self.query_switch(ip).await,
        };
        if let DiscoveryOutcome::Ready(neighbors) = &outcome {
            debug!(%host, count = neighbors.len(), "LLDP neighbours");
        }
        outcome
    }

    async fn refresh(&self) {
        let cmd = format!("{LLDPCLI_CMD} update");
        match shell::exec(&cmd).await {
            Ok(result) if result.success() => {}
            Ok(result) => warn!(reason = %result.failure_reason(), "LLDP refresh failed"),
            Err(e) => warn!(error = %e, "LLDP refresh failed"),
        }
    }
}

/// Management address as advertised, before usability checks
fn management_ip(text: &str) -> Result<IpAddr, String> {
    let ip: IpAddr = text
        .trim()
        .parse()
        .map_err(|_| format!("malformed management address {text:?}"))?;
    if ip.is_unspecified() {
        return Err(format!("management address {ip} is not configured yet"));
    }
    Ok(ip)
}

#[derive(Debug, Default)]
struct LocalNeighbor {
    mac: Option<String>,
    ip: Option<String>,
}

/// Parse `lldpctl -f keyvalue` output.
///
/// Ports are numbered by the ordinal of the reporting interface (sorted by
/// name), then by neighbour order on that interface.
pub fn parse_lldpctl_keyvalue(output: &str, interface: Option<&str>) -> DiscoveryOutcome {
    let mut by_interface: BTreeMap<&str, Vec<LocalNeighbor>> = BTreeMap::new();

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let Some(rest) = key.trim().strip_prefix("lldp.") else {
            continue;
        };
        let Some((iface, attribute)) = rest.split_once('.') else {
            continue;
        };
        if interface.is_some_and(|wanted| wanted != iface) {
            continue;
        }

        let neighbors = by_interface.entry(iface).or_default();
        match attribute {
            "chassis.mac" => {
                // a repeated chassis starts the next neighbour on this interface
                if neighbors.last().map_or(true, |n| n.mac.is_some()) {
                    neighbors.push(LocalNeighbor::default());
                }
                if let Some(current) = neighbors.last_mut() {
                    current.mac = Some(value.trim().to_string());
                }
            }
            "chassis.mgmt-ip" => {
                if neighbors.is_empty() {
                    neighbors.push(LocalNeighbor::default());
                }
                if let Some(current) = neighbors.last_mut() {
                    // keep the first advertised address
                    current.ip.get_or_insert_with(|| value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let mut result = PortNeighbors::new();
    let mut port = 0;
    for (iface, neighbors) in by_interface {
        for neighbor in neighbors {
            port += 1;
            let Some(mac_text) = neighbor.mac else {
                continue;
            };
            let Some(mac) = MacAddress::parse(&mac_text) else {
                debug!(iface, value = %mac_text, "Ignoring non-MAC chassis id");
                continue;
            };
            let ip = match neighbor.ip.as_deref().map(management_ip) {
                None => None,
                Some(Ok(ip)) => Some(ip),
                Some(Err(reason)) => return DiscoveryOutcome::NeedsRetry { reason },
            };
            result.insert(port, NeighborInfo { mac, ip });
        }
    }
    DiscoveryOutcome::Ready(result)
}

/// `<timemark>.<port>.<index>` row identifier of the remote tables
fn parse_row_index(suffix: &str) -> Option<((u32, u32, u32), &str)> {
    let mut parts = suffix.splitn(4, '.');
    let timemark = parts.next()?.parse().ok()?;
    let port = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    Some(((timemark, port, index), parts.next().unwrap_or("")))
}

/// `1.4.a.b.c.d` address part of a lldpRemManAddrTable index
fn parse_ipv4_suffix(suffix: &str) -> Option<Ipv4Addr> {
    let parts: Vec<u32> = suffix
        .split('.')
        .map(|p| p.parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [ADDR_FAMILY_IPV4, 4, a, b, c, d] => Some(Ipv4Addr::new(
            u8::try_from(*a).ok()?,
            u8::try_from(*b).ok()?,
            u8::try_from(*c).ok()?,
            u8::try_from(*d).ok()?,
        )),
        _ => None,
    }
}

/// Parse `snmpwalk -On -Oq` output of the lldpRemoteData subtree.
pub fn parse_snmp_remote_table(output: &str) -> DiscoveryOutcome {
    let mut chassis: BTreeMap<(u32, u32, u32), MacAddress> = BTreeMap::new();
    let mut addresses: BTreeMap<(u32, u32, u32), Ipv4Addr> = BTreeMap::new();

    for line in output.lines() {
        let line = line.trim();
        let (oid, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let value = value.trim().trim_matches('"');

        if let Some(suffix) = oid.strip_prefix(LLDP_REM_CHASSIS_ID_OID) {
            let Some((row, _)) = parse_row_index(suffix) else {
                continue;
            };
            match MacAddress::parse(value) {
                Some(mac) => {
                    chassis.insert(row, mac);
                }
                None => debug!(oid, value, "Ignoring non-MAC chassis id"),
            }
        } else if let Some(suffix) = oid.strip_prefix(LLDP_REM_MAN_ADDR_OID) {
            let Some((row, rest)) = parse_row_index(suffix) else {
                continue;
            };
            if let Some(ip) = parse_ipv4_suffix(rest) {
                addresses.entry(row).or_insert(ip);
            }
        }
    }

    let mut result = PortNeighbors::new();
    for (row @ (_, port, _), mac) in chassis {
        let ip = match addresses.get(&row) {
            None => None,
            Some(ip) if ip.is_unspecified() => {
                return DiscoveryOutcome::NeedsRetry {
                    reason: format!("neighbour {mac} on port {port} has no management address yet"),
                };
            }
            Some(ip) => Some(IpAddr::V4(*ip)),
        };
        // several neighbours on one port: keep the first one reported
        result.entry(port).or_insert(NeighborInfo { mac, ip });
    }
    DiscoveryOutcome::Ready(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LLDPCTL_OUTPUT: &str = "\
lldp.walt-net.via=LLDP
lldp.walt-net.rid=1
lldp.walt-net.chassis.mac=a0:40:a0:00:00:01
lldp.walt-net.chassis.name=switch-A
lldp.walt-net.chassis.mgmt-ip=192.168.152.2
lldp.walt-net.chassis.mgmt-ip=fe80::1
lldp.walt-net.port.ifname=port 12
lldp.eth1.chassis.mac=11:22:33:44:55:66
";

    fn ready(outcome: DiscoveryOutcome) -> PortNeighbors {
        match outcome {
            DiscoveryOutcome::Ready(neighbors) => neighbors,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_parse_lldpctl_filters_interface() {
        let neighbors = ready(parse_lldpctl_keyvalue(LLDPCTL_OUTPUT, Some("walt-net")));
        assert_eq!(neighbors.len(), 1);
        let neighbor = neighbors[&1];
        assert_eq!(neighbor.mac.to_string(), "a0:40:a0:00:00:01");
        assert_eq!(neighbor.ip, Some("192.168.152.2".parse().unwrap()));
    }

    #[test]
    fn test_parse_lldpctl_numbers_interfaces_by_name() {
        let neighbors = ready(parse_lldpctl_keyvalue(LLDPCTL_OUTPUT, None));
        // eth1 sorts before walt-net
        assert_eq!(neighbors[&1].mac.to_string(), "11:22:33:44:55:66");
        assert_eq!(neighbors[&1].ip, None);
        assert_eq!(neighbors[&2].mac.to_string(), "a0:40:a0:00:00:01");
    }

    #[test]
    fn test_parse_lldpctl_unspecified_address_needs_retry() {
        let output = "lldp.walt-net.chassis.mac=a0:40:a0:00:00:01\n\
                      lldp.walt-net.chassis.mgmt-ip=0.0.0.0\n";
        assert!(matches!(
            parse_lldpctl_keyvalue(output, None),
            DiscoveryOutcome::NeedsRetry { .. }
        ));
    }

    #[test]
    fn test_parse_lldpctl_empty() {
        assert!(ready(parse_lldpctl_keyvalue("", None)).is_empty());
    }

    const SNMP_OUTPUT: &str = "\
.1.0.8802.1.1.2.1.4.1.1.4.0.1.1 4
.1.0.8802.1.1.2.1.4.1.1.5.0.1.1 \"B8 27 EB 00 00 01 \"
.1.0.8802.1.1.2.1.4.1.1.5.0.2.3 \"DC A6 32 00 00 02 \"
.1.0.8802.1.1.2.1.4.1.1.5.0.5.2 \"A0 40 A0 00 00 09 \"
.1.0.8802.1.1.2.1.4.1.1.5.0.6.4 \"switch-B\"
.1.0.8802.1.1.2.1.4.2.1.3.0.1.1.1.4.192.168.152.10 2
.1.0.8802.1.1.2.1.4.2.1.3.0.5.2.1.4.192.168.152.3 2
";

    #[test]
    fn test_parse_snmp_remote_table() {
        let neighbors = ready(parse_snmp_remote_table(SNMP_OUTPUT));
        assert_eq!(neighbors.keys().copied().collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(neighbors[&1].mac.to_string(), "b8:27:eb:00:00:01");
        assert_eq!(neighbors[&1].ip, Some("192.168.152.10".parse().unwrap()));
        assert_eq!(neighbors[&2].ip, None);
        assert_eq!(neighbors[&5].mac.to_string(), "a0:40:a0:00:00:09");
        assert_eq!(neighbors[&5].ip, Some("192.168.152.3".parse().unwrap()));
    }

    #[test]
    fn test_parse_snmp_unspecified_address_needs_retry() {
        let output = "\
.1.0.8802.1.1.2.1.4.1.1.5.0.5.2 \"A0 40 A0 00 00 09 \"
.1.0.8802.1.1.2.1.4.2.1.3.0.5.2.1.4.0.0.0.0 2
";
        assert!(matches!(
            parse_snmp_remote_table(output),
            DiscoveryOutcome::NeedsRetry { .. }
        ));
    }

    #[test]
    fn test_parse_ipv4_suffix() {
        assert_eq!(
            parse_ipv4_suffix("1.4.10.0.0.1"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(parse_ipv4_suffix("2.16.254.128.0.0"), None);
        assert_eq!(parse_ipv4_suffix("1.4.300.0.0.1"), None);
    }
}
