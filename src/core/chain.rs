//! Egress rule-chain construction and installation
//!
//! Rule order is load-bearing. First match wins, so the chain is:
//!
//! 1. loopback
//! 2. established / related
//! 3. DNS (udp and tcp port 53) to each resolver of the family
//! 4. IPv4: the default gateway's /24
//! 5. IPv6: the default gateway address
//! 6. destination in the range set
//! 7. destination in the host set
//! 8. drop
//!
//! Installation is idempotent: create if absent, replace the chain body, drop
//! every existing jump into it, and insert one jump at the head of the output
//! hook.

use crate::core::address::FamilySets;
use crate::core::error::Result;
use crate::core::firewall::{CtState, Family, Match, Protocol, Rule, RuleChain};
use crate::core::state::FirewallState;
use crate::validators::sanitize_comment;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{debug, info, warn};

pub const DNS_PORT: u16 = 53;
pub const LOOPBACK: &str = "lo";

/// Builds the egress chain for one family.
///
/// Resolvers of the other family are ignored. `gateway` is the family's
/// gateway exception as computed by
/// [`crate::core::host::HostNetwork::gateway_exception`].
pub fn build_egress_chain(
    name: &str,
    family: Family,
    resolvers: &[IpAddr],
    gateway: Option<IpNetwork>,
    sets: &FamilySets,
) -> RuleChain {
    let mut rules = vec![
        Rule::accept("loopback", Match::OutputInterface(LOOPBACK.to_string())),
        Rule::accept(
            "established related",
            Match::ConnState(vec![CtState::Established, CtState::Related]),
        ),
    ];

    for resolver in resolvers.iter().filter(|r| Family::of(r) == family) {
        let net = IpNetwork::from(*resolver);
        for proto in [Protocol::Udp, Protocol::Tcp] {
            rules.push(Rule::accept(
                sanitize_comment(&format!("dns {proto} {resolver}")),
                Match::Destination {
                    net,
                    service: Some((proto, DNS_PORT)),
                },
            ));
        }
    }

    if let Some(net) = gateway.filter(|net| Family::of_network(net) == family) {
        let comment = match family {
            Family::V4 => format!("host subnet {net}"),
            Family::V6 => format!("gateway {}", net.ip()),
        };
        rules.push(Rule::accept(
            sanitize_comment(&comment),
            Match::Destination { net, service: None },
        ));
    } else {
        debug!("No {} gateway exception", family.label());
    }

    rules.push(Rule::accept(
        "allowed nets",
        Match::DestinationInSet(sets.nets.name.clone()),
    ));
    rules.push(Rule::accept(
        "allowed hosts",
        Match::DestinationInSet(sets.hosts.name.clone()),
    ));
    rules.push(Rule::drop("default deny"));

    RuleChain {
        family,
        name: name.to_string(),
        rules,
    }
}

/// The two inbound exceptions: loopback and established/related.
pub fn input_exceptions() -> [Rule; 2] {
    [
        Rule::accept(
            "dcfw input loopback",
            Match::InputInterface(LOOPBACK.to_string()),
        ),
        Rule::accept(
            "dcfw input established",
            Match::ConnState(vec![CtState::Established, CtState::Related]),
        ),
    ]
}

/// Installs `chain` and links it into the output hook exactly once.
///
/// # Errors
///
/// Fails if the chain cannot be created or populated, or if the jump cannot
/// be inserted. Removing stale jumps never fails.
pub async fn install(state: &dyn FirewallState, chain: &RuleChain) -> Result<()> {
    let family = chain.family;
    info!(
        "Installing {} chain {} ({} rules)",
        family.label(),
        chain.name,
        chain.rules.len()
    );

    state.ensure_chain(family, &chain.name).await?;
    state.replace_chain(chain).await?;

    let removed = state.detach_chain(family, &chain.name).await;
    if removed > 0 {
        debug!("Removed {removed} stale jump(s) to {}", chain.name);
    }
    state.attach_chain(family, &chain.name).await?;

    for rule in input_exceptions() {
        match state.ensure_input_rule(family, &rule).await {
            Ok(true) => debug!("Added input exception '{}'", rule.comment),
            Ok(false) => {}
            Err(e) => warn!("Could not add input exception '{}': {e}", rule.comment),
        }
    }

    info!("{} egress chain active", family.label());
    Ok(())
}
