//! Egress rule model, first-match evaluation, and nft text rendering
//!
//! A [`RuleChain`] is an ordered list of [`Rule`]s scoped to one [`Family`].
//! Evaluation walks the rules in order and the first matching rule decides the
//! verdict. Chains produced by the builder always end in an unconditional drop,
//! so a packet never falls off the end of an installed egress chain.
//!
//! # Example
//!
//! ```
//! use dcfw::core::firewall::{Action, Family, Match, Packet, Protocol, Rule, RuleChain};
//!
//! let chain = RuleChain {
//!     family: Family::V4,
//!     name: "egress_allow".to_string(),
//!     rules: vec![
//!         Rule::accept("loopback", Match::OutputInterface("lo".to_string())),
//!         Rule::drop("default deny"),
//!     ],
//! };
//!
//! let packet = Packet::new("1.1.1.1".parse().unwrap(), Protocol::Tcp, 443);
//! let verdict = chain.verdict(&packet, &|_: &str, _: std::net::IpAddr| false);
//! assert_eq!(verdict.action, Action::Drop);
//! assert_eq!(verdict.rule, Some(1));
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::net::IpAddr;

/// Address family of a packet filter table.
///
/// Each family gets its own table, sets, and egress chain.
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
    strum::AsRefStr,
)]
pub enum Family {
    #[strum(serialize = "ip")]
    V4,
    #[strum(serialize = "ip6")]
    V6,
}

impl Family {
    /// nftables family keyword (`ip` / `ip6`)
    pub const fn nft_family(self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    /// nftables element type for single-address sets
    pub const fn addr_type(self) -> &'static str {
        match self {
            Family::V4 => "ipv4_addr",
            Family::V6 => "ipv6_addr",
        }
    }

    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub const fn of_network(net: &IpNetwork) -> Self {
        match net {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }
}

/// Transport protocol matched by service rules
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// Rule action. Egress chains only ever accept or drop.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Action {
    #[strum(serialize = "accept")]
    Accept,
    #[strum(serialize = "drop")]
    Drop,
}

/// Connection-tracking state
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum CtState {
    #[strum(serialize = "new")]
    New,
    #[strum(serialize = "established")]
    Established,
    #[strum(serialize = "related")]
    Related,
}

/// Match predicate of a single rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    /// Matches every packet
    Any,
    /// Outbound interface name (`oifname`)
    OutputInterface(String),
    /// Inbound interface name (`iifname`)
    InputInterface(String),
    /// Packet belongs to a tracked connection in one of these states
    ConnState(Vec<CtState>),
    /// Destination inside `net`, optionally restricted to one transport service
    Destination {
        net: IpNetwork,
        service: Option<(Protocol, u16)>,
    },
    /// Destination is a member of the named address set
    DestinationInSet(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Stored as the nft rule comment; also the identity used by check-then-add
    pub comment: String,
    pub matcher: Match,
    pub action: Action,
}

impl Rule {
    pub fn accept(comment: impl Into<String>, matcher: Match) -> Self {
        Self {
            comment: comment.into(),
            matcher,
            action: Action::Accept,
        }
    }

    /// Unconditional drop
    pub fn drop(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
            matcher: Match::Any,
            action: Action::Drop,
        }
    }

    /// Returns true if `packet` satisfies this rule's predicate.
    ///
    /// `sets` answers membership queries for [`Match::DestinationInSet`].
    pub fn matches(&self, packet: &Packet, sets: &dyn SetMembership) -> bool {
        match &self.matcher {
            Match::Any => true,
            Match::OutputInterface(name) | Match::InputInterface(name) => {
                packet.interface == *name
            }
            Match::ConnState(states) => packet.conn_state.is_some_and(|s| states.contains(&s)),
            Match::Destination { net, service } => {
                net.contains(packet.destination)
                    && service.is_none_or(|(proto, port)| {
                        packet.protocol == proto && packet.port == port
                    })
            }
            Match::DestinationInSet(set) => sets.contains(set, packet.destination),
        }
    }

    /// Renders the rule in nft list syntax, e.g. `ip daddr @allowed_hosts_v4 accept`.
    pub fn to_nft_text(&self, family: Family) -> String {
        let mut out = String::new();
        match &self.matcher {
            Match::Any => {}
            Match::OutputInterface(name) => {
                let _ = write!(out, "oifname \"{name}\" ");
            }
            Match::InputInterface(name) => {
                let _ = write!(out, "iifname \"{name}\" ");
            }
            Match::ConnState(states) => {
                let states: Vec<String> = states.iter().map(ToString::to_string).collect();
                let _ = write!(out, "ct state {{ {} }} ", states.join(", "));
            }
            Match::Destination { net, service } => {
                let _ = write!(out, "{} daddr {} ", family.nft_family(), display_net(net));
                if let Some((proto, port)) = service {
                    let _ = write!(out, "{proto} dport {port} ");
                }
            }
            Match::DestinationInSet(set) => {
                let _ = write!(out, "{} daddr @{set} ", family.nft_family());
            }
        }
        let _ = write!(out, "{} comment \"{}\"", self.action, self.comment);
        out
    }
}

/// Renders host networks (/32, /128) as bare addresses
pub fn display_net(net: &IpNetwork) -> String {
    if net.prefix() == max_prefix(Family::of_network(net)) {
        net.ip().to_string()
    } else {
        net.to_string()
    }
}

pub const fn max_prefix(family: Family) -> u8 {
    match family {
        Family::V4 => 32,
        Family::V6 => 128,
    }
}

/// Answers "is `addr` a member of set `name`?" during evaluation.
pub trait SetMembership {
    fn contains(&self, set: &str, addr: IpAddr) -> bool;
}

impl<F> SetMembership for F
where
    F: Fn(&str, IpAddr) -> bool,
{
    fn contains(&self, set: &str, addr: IpAddr) -> bool {
        self(set, addr)
    }
}

/// A packet as seen by the egress hook, reduced to the fields rules inspect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub destination: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
    /// Interface the packet leaves (egress) or arrives on (ingress)
    pub interface: String,
    pub conn_state: Option<CtState>,
}

impl Packet {
    /// A fresh outbound connection attempt on `eth0`
    pub fn new(destination: IpAddr, protocol: Protocol, port: u16) -> Self {
        Self {
            destination,
            protocol,
            port,
            interface: "eth0".to_string(),
            conn_state: Some(CtState::New),
        }
    }

    pub fn on_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn with_state(mut self, state: CtState) -> Self {
        self.conn_state = Some(state);
        self
    }
}

/// Outcome of evaluating a packet against a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Index of the deciding rule; `None` when nothing matched
    pub rule: Option<usize>,
    pub action: Action,
}

/// A named, ordered egress rule chain for one address family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChain {
    pub family: Family,
    pub name: String,
    pub rules: Vec<Rule>,
}

impl RuleChain {
    /// First-match-wins evaluation.
    ///
    /// A packet matching no rule returns to the calling hook, whose policy is
    /// accept; builder-produced chains never reach that case.
    pub fn verdict(&self, packet: &Packet, sets: &dyn SetMembership) -> Verdict {
        self.rules
            .iter()
            .position(|rule| rule.matches(packet, sets))
            .map_or(
                Verdict {
                    rule: None,
                    action: Action::Accept,
                },
                |idx| Verdict {
                    rule: Some(idx),
                    action: self.rules[idx].action,
                },
            )
    }

    pub fn to_nft_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "chain {} {{", self.name);
        for rule in &self.rules {
            let _ = writeln!(out, "    {}", rule.to_nft_text(self.family));
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for RuleChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_nft_text())
    }
}
