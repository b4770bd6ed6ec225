//! Host network facts the egress chain depends on
//!
//! - DNS resolvers: configured stub resolvers plus every `nameserver` entry of
//!   the resolver config file. They are exempted from default-deny on port 53.
//! - Default gateways: read from the kernel routing tables in `/proc`. The
//!   IPv4 gateway's /24 becomes the trusted host subnet; the IPv6 gateway is
//!   trusted as a single address.
//!
//! Every reader is best-effort: an unreadable file yields no facts and a
//! warning, never an error.

use crate::config::Config;
use crate::core::firewall::Family;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::{debug, info, warn};

/// Width of the IPv4 host-subnet exception
pub const HOST_SUBNET_PREFIX: u8 = 24;

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostNetwork {
    /// Deduplicated, in discovery order
    pub resolvers: Vec<IpAddr>,
    pub gateway_v4: Option<Ipv4Addr>,
    pub gateway_v6: Option<Ipv6Addr>,
}

impl HostNetwork {
    /// Reads the resolver config and both routing tables named by `config`.
    pub async fn discover(config: &Config) -> Self {
        let mut resolvers = config.stub_resolvers.clone();
        if let Some(text) = read_best_effort(&config.resolv_conf).await {
            resolvers.extend(parse_resolv_conf(&text));
        }
        let mut seen = Vec::with_capacity(resolvers.len());
        for addr in resolvers {
            if !seen.contains(&addr) {
                seen.push(addr);
            }
        }

        let gateway_v4 = read_best_effort(&config.route_table_v4)
            .await
            .and_then(|text| parse_ipv4_default_gateway(&text));
        let gateway_v6 = read_best_effort(&config.route_table_v6)
            .await
            .and_then(|text| parse_ipv6_default_gateway(&text));

        let host = Self {
            resolvers: seen,
            gateway_v4,
            gateway_v6,
        };
        info!(
            resolvers = ?host.resolvers,
            gateway_v4 = ?host.gateway_v4,
            gateway_v6 = ?host.gateway_v6,
            "Discovered host network"
        );
        host
    }

    /// Resolver addresses of one family
    pub fn resolvers(&self, family: Family) -> Vec<IpAddr> {
        self.resolvers
            .iter()
            .copied()
            .filter(|addr| Family::of(addr) == family)
            .collect()
    }

    /// The destination trusted independent of the allowlist for `family`:
    /// the gateway's /24 for IPv4, the gateway itself for IPv6.
    ///
    /// The IPv6 exception is intentionally not widened to a subnet.
    pub fn gateway_exception(&self, family: Family) -> Option<IpNetwork> {
        match family {
            Family::V4 => self.gateway_v4.map(|gw| IpNetwork::V4(host_subnet(gw))),
            Family::V6 => self.gateway_v6.map(|gw| IpNetwork::V6(Ipv6Network::from(gw))),
        }
    }
}

async fn read_best_effort(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Cannot read {}: {e}", path.display());
            None
        }
    }
}

/// The /24 network containing `gateway`
pub fn host_subnet(gateway: Ipv4Addr) -> Ipv4Network {
    let mask = u32::MAX << (32 - u32::from(HOST_SUBNET_PREFIX));
    let network = Ipv4Addr::from(u32::from(gateway) & mask);
    // The prefix is a constant below 33, so construction cannot fail
    Ipv4Network::new(network, HOST_SUBNET_PREFIX).unwrap_or_else(|_| Ipv4Network::from(network))
}

/// Extracts `nameserver` addresses from resolv.conf text.
///
/// Link-local IPv6 scope suffixes (`fe80::1%eth0`) are dropped.
pub fn parse_resolv_conf(text: &str) -> Vec<IpAddr> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next() != Some("nameserver") {
                return None;
            }
            let value = fields.next()?;
            let value = value.split('%').next().unwrap_or(value);
            match value.parse::<IpAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    debug!("Ignoring unparsable nameserver entry '{value}'");
                    None
                }
            }
        })
        .collect()
}

/// Finds the default route's next hop in `/proc/net/route` text.
///
/// Addresses in that file are hex dumps of the in-memory (network order)
/// value, printed as a little-endian u32.
pub fn parse_ipv4_default_gateway(text: &str) -> Option<Ipv4Addr> {
    text.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return None;
        }
        let destination = u32::from_str_radix(fields[1], 16).ok()?;
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let flags = u32::from_str_radix(fields[3], 16).ok()?;
        let mask = u32::from_str_radix(fields[7], 16).ok()?;

        let is_default = destination == 0 && mask == 0;
        let usable = flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0 && gateway != 0;
        (is_default && usable).then(|| Ipv4Addr::from(gateway.to_le_bytes()))
    })
}

/// Finds the default route's next hop in `/proc/net/ipv6_route` text.
pub fn parse_ipv6_default_gateway(text: &str) -> Option<Ipv6Addr> {
    text.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[9] == "lo" {
            return None;
        }
        let destination = u128::from_str_radix(fields[0], 16).ok()?;
        let prefix = u8::from_str_radix(fields[1], 16).ok()?;
        let next_hop = u128::from_str_radix(fields[4], 16).ok()?;

        (destination == 0 && prefix == 0 && next_hop != 0).then(|| Ipv6Addr::from(next_hop))
    })
}
