// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Local network information

use crate::types::NetworkInterface;
use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

/// Interface name prefixes that are never the LAN
const VIRTUAL_PREFIXES: &[&str] = &["docker", "br-", "veth", "virbr", "tun", "tailscale"];

/// Best guess at this host's LAN address.
///
/// Prefers an IPv4 address on a physical-looking interface, then whatever
/// the hostname resolves to, then loopback.
pub fn detect_lan_address() -> IpAddr {
    if let Some(ip) = lan_interface_address() {
        return ip;
    }

    if let Some(ip) = hostname_address() {
        tracing::warn!("No LAN interface found, falling back to hostname address {}", ip);
        return ip;
    }

    tracing::warn!("Could not determine a LAN address, using loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn lan_interface_address() -> Option<IpAddr> {
    let mut candidates: Vec<(String, Ipv4Addr)> = list_afinet_netifas()
        .ok()?
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some((name, v4)),
            _ => None,
        })
        .filter(|(name, _)| !VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)))
        .collect();

    // Private ranges first, then by interface name so the choice is stable
    candidates.sort_by(|a, b| b.1.is_private().cmp(&a.1.is_private()).then(a.0.cmp(&b.0)));
    candidates.first().map(|(_, ip)| IpAddr::V4(*ip))
}

fn hostname_address() -> Option<IpAddr> {
    let host = hostname::get().ok()?.to_string_lossy().to_string();
    format!("{}:0", host)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
}

/// Get all network interfaces with their IP addresses
pub fn network_interfaces() -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = list_afinet_netifas()
        .map(|netifas| {
            netifas
                .into_iter()
                .map(|(name, ip)| NetworkInterface {
                    name,
                    ip: ip.to_string(),
                    is_loopback: ip.is_loopback(),
                })
                .collect()
        })
        .unwrap_or_default();

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

/// Every other host address in `local`'s /24, suffixes 1 to 254
pub fn subnet_hosts(local: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = local.octets();
    (1..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != local)
        .collect()
}
