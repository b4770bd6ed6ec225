//! Resolved addresses, the allowlist they form, and the address sets that hold them

use crate::core::firewall::{Family, max_prefix};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Where a permitted address came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provenance {
    Domain(String),
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Domain(domain) => f.write_str(domain),
        }
    }
}

/// A concrete address produced by resolution, tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolvedAddress {
    pub addr: IpAddr,
    pub provenance: Provenance,
}

/// Element kind of an address set
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
)]
pub enum SetKind {
    /// Single addresses
    #[strum(serialize = "host")]
    Host,
    /// CIDR ranges (nft interval set)
    #[strum(serialize = "net")]
    Net,
}

/// A named, typed address set living in one family's table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSet {
    pub name: String,
    pub kind: SetKind,
    pub family: Family,
}

impl AddressSet {
    pub fn new(name: impl Into<String>, kind: SetKind, family: Family) -> Self {
        Self {
            name: name.into(),
            kind,
            family,
        }
    }

    /// Whether `element` may be stored in this set: same family, and host
    /// sets only take full-length prefixes.
    pub fn accepts(&self, element: &IpNetwork) -> bool {
        Family::of_network(element) == self.family
            && (self.kind == SetKind::Net || element.prefix() == max_prefix(self.family))
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.family, self.name, self.kind)
    }
}

/// The host and range sets of one family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySets {
    pub hosts: AddressSet,
    pub nets: AddressSet,
}

/// Every destination the egress chain will permit by set membership
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    pub hosts_v4: BTreeSet<Ipv4Addr>,
    pub hosts_v6: BTreeSet<Ipv6Addr>,
    pub nets_v4: BTreeSet<Ipv4Network>,
    pub nets_v6: BTreeSet<Ipv6Network>,
}

impl Allowlist {
    pub fn add_host(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                self.hosts_v4.insert(v4);
            }
            IpAddr::V6(v6) => {
                self.hosts_v6.insert(v6);
            }
        }
    }

    /// Host addresses of `family` as set elements
    pub fn hosts(&self, family: Family) -> Vec<IpNetwork> {
        match family {
            Family::V4 => self
                .hosts_v4
                .iter()
                .map(|a| IpNetwork::V4(Ipv4Network::from(*a)))
                .collect(),
            Family::V6 => self
                .hosts_v6
                .iter()
                .map(|a| IpNetwork::V6(Ipv6Network::from(*a)))
                .collect(),
        }
    }

    /// Ranges of `family` as set elements
    pub fn nets(&self, family: Family) -> Vec<IpNetwork> {
        match family {
            Family::V4 => self.nets_v4.iter().copied().map(IpNetwork::V4).collect(),
            Family::V6 => self.nets_v6.iter().copied().map(IpNetwork::V6).collect(),
        }
    }

    /// Total host and range entries across both families
    pub fn len(&self) -> usize {
        self.hosts_v4.len() + self.hosts_v6.len() + self.nets_v4.len() + self.nets_v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts_v4.is_empty()
            && self.hosts_v6.is_empty()
            && self.nets_v4.is_empty()
            && self.nets_v6.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_set_rejects_ranges_and_other_family() {
        let set = AddressSet::new("allowed_hosts_v4", SetKind::Host, Family::V4);
        assert!(set.accepts(&"1.2.3.4/32".parse().unwrap()));
        assert!(!set.accepts(&"1.2.3.0/24".parse().unwrap()));
        assert!(!set.accepts(&"2001:db8::1/128".parse().unwrap()));
    }

    #[test]
    fn test_net_set_accepts_any_prefix_of_its_family() {
        let set = AddressSet::new("allowed_nets_v6", SetKind::Net, Family::V6);
        assert!(set.accepts(&"2001:db8::/32".parse().unwrap()));
        assert!(set.accepts(&"2001:db8::1/128".parse().unwrap()));
        assert!(!set.accepts(&"10.0.0.0/8".parse().unwrap()));
    }

    #[test]
    fn test_allowlist_deduplicates_hosts() {
        let mut allow = Allowlist::default();
        allow.add_host("1.2.3.4".parse().unwrap());
        allow.add_host("1.2.3.4".parse().unwrap());
        allow.add_host("2001:db8::1".parse().unwrap());

        assert_eq!(allow.hosts(Family::V4).len(), 1);
        assert_eq!(allow.hosts(Family::V6).len(), 1);
        assert_eq!(
            allow.hosts(Family::V4)[0],
            "1.2.3.4/32".parse::<IpNetwork>().unwrap()
        );
    }

    #[test]
    fn test_provenance_display() {
        assert_eq!(
            Provenance::Domain("sentry.io".to_string()).to_string(),
            "sentry.io"
        );
    }
}
