//! End-to-end install: resolve, populate sets, build and link chains
//!
//! Everything runs sequentially. IPv4 is required; a host without an IPv6
//! packet filter gets the IPv4 policy only.

use crate::config::Config;
use crate::core::address::Allowlist;
use crate::core::chain::{self, build_egress_chain};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Family, RuleChain};
use crate::core::host::HostNetwork;
use crate::core::resolver::{
    NameResolver, RangeFeed, RangeSets, build_allowlist, fetch_ranges, resolve_all,
};
use crate::core::sets::AddressSetStore;
use crate::core::state::FirewallState;
use tracing::{info, warn};

/// What an install run put in place
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub host: HostNetwork,
    pub allowlist: Allowlist,
    /// Installed chains, IPv4 first
    pub chains: Vec<RuleChain>,
    /// Families skipped because their packet filter is missing
    pub skipped: Vec<Family>,
}

impl InstallReport {
    pub fn chain(&self, family: Family) -> Option<&RuleChain> {
        self.chains.iter().find(|c| c.family == family)
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    state: &'a dyn FirewallState,
    resolver: &'a dyn NameResolver,
    feed: Option<&'a dyn RangeFeed>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        state: &'a dyn FirewallState,
        resolver: &'a dyn NameResolver,
    ) -> Self {
        Self {
            config,
            state,
            resolver,
            feed: None,
        }
    }

    /// Uses `feed` when the configuration enables the range feed.
    pub fn with_feed(mut self, feed: &'a dyn RangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Resolves every domain and fetches the range feed. Never fails.
    pub async fn gather(&self) -> Allowlist {
        let resolutions = resolve_all(self.resolver, &self.config.allowed_domains).await;
        let failed = resolutions.iter().filter(|r| r.is_empty()).count();
        if failed > 0 {
            warn!(
                "{failed} of {} domains contributed no addresses",
                resolutions.len()
            );
        }

        let ranges = match self.feed {
            Some(feed) if self.config.range_feed.enabled => {
                fetch_ranges(feed, &self.config.range_feed.categories).await
            }
            _ => {
                info!("Range feed disabled");
                RangeSets::default()
            }
        };

        let allowlist = build_allowlist(&resolutions, &ranges);
        info!(
            "Allowlist: {} IPv4 hosts, {} IPv6 hosts, {} IPv4 ranges, {} IPv6 ranges",
            allowlist.hosts_v4.len(),
            allowlist.hosts_v6.len(),
            allowlist.nets_v4.len(),
            allowlist.nets_v6.len()
        );
        allowlist
    }

    /// Runs the whole install.
    ///
    /// # Errors
    ///
    /// Returns `Error::FamilyUnavailable(V4)` when there is no IPv4 packet
    /// filter, and propagates any set or chain failure. Resolution and feed
    /// failures are not errors.
    pub async fn install(&self) -> Result<InstallReport> {
        if !self.state.family_available(Family::V4).await {
            return Err(Error::FamilyUnavailable(Family::V4));
        }
        let mut families = vec![Family::V4];
        let mut skipped = Vec::new();
        if self.state.family_available(Family::V6).await {
            families.push(Family::V6);
        } else {
            info!("IPv6 packet filter unavailable, skipping IPv6");
            skipped.push(Family::V6);
        }

        let host = HostNetwork::discover(self.config).await;
        let allowlist = self.gather().await;

        let names = &self.config.names;
        let store = AddressSetStore::new(self.state);
        for family in &families {
            store
                .populate(&names.family_sets(*family), &allowlist, *family)
                .await?;
        }

        let mut chains = Vec::with_capacity(families.len());
        for family in families {
            let chain = build_egress_chain(
                &names.egress_chain,
                family,
                &host.resolvers(family),
                host.gateway_exception(family),
                &names.family_sets(family),
            );
            chain::install(self.state, &chain).await?;
            chains.push(chain);
        }

        Ok(InstallReport {
            host,
            allowlist,
            chains,
            skipped,
        })
    }
}
