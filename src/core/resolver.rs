//! Turns the allowlist into concrete addresses
//!
//! Two sources feed the allowlist:
//!
//! - [`NameResolver`]: one lookup per configured domain through the system
//!   resolver. A failed lookup contributes nothing and is logged.
//! - [`RangeFeed`]: an optional JSON document of published CIDR ranges. A
//!   failed fetch or parse yields an empty [`RangeSets`] and a warning.
//!
//! Neither source retries. The next run of the initializer is the retry.

use crate::config::RangeFeedConfig;
use crate::core::address::{Allowlist, Provenance, ResolvedAddress};
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves a host name to addresses
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup(&self, domain: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// The host's resolver (`getaddrinfo` via tokio)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn lookup(&self, domain: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Distinct addresses a single domain resolved to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainResolution {
    pub domain: String,
    pub v4: BTreeSet<Ipv4Addr>,
    pub v6: BTreeSet<Ipv6Addr>,
}

impl DomainResolution {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = ResolvedAddress> + '_ {
        self.v4
            .iter()
            .map(|a| IpAddr::V4(*a))
            .chain(self.v6.iter().map(|a| IpAddr::V6(*a)))
            .map(|addr| ResolvedAddress {
                addr,
                provenance: Provenance::Domain(self.domain.clone()),
            })
    }
}

/// Resolves one domain. Never fails: errors produce an empty resolution.
pub async fn resolve_domain(resolver: &dyn NameResolver, domain: &str) -> DomainResolution {
    let mut resolution = DomainResolution {
        domain: domain.to_string(),
        ..DomainResolution::default()
    };

    match resolver.lookup(domain).await {
        Ok(addrs) => {
            for addr in addrs {
                match addr {
                    IpAddr::V4(v4) => {
                        resolution.v4.insert(v4);
                    }
                    IpAddr::V6(v6) => {
                        resolution.v6.insert(v6);
                    }
                }
            }
            if resolution.is_empty() {
                warn!("{domain}: resolver returned no addresses, skipping");
            } else {
                info!(
                    "ok   {domain}: {} IPv4, {} IPv6",
                    resolution.v4.len(),
                    resolution.v6.len()
                );
            }
        }
        Err(e) => warn!("{domain}: resolution failed ({e}), skipping"),
    }

    resolution
}

/// Resolves every domain in order, one lookup each.
pub async fn resolve_all(resolver: &dyn NameResolver, domains: &[String]) -> Vec<DomainResolution> {
    let mut resolutions = Vec::with_capacity(domains.len());
    for domain in domains {
        resolutions.push(resolve_domain(resolver, domain).await);
    }
    resolutions
}

/// Source of the published range document
#[async_trait]
pub trait RangeFeed: Send + Sync {
    /// Returns the raw JSON body.
    async fn fetch(&self) -> Result<String>;
}

/// HTTP GET against the configured feed endpoint with bounded timeouts
pub struct HttpRangeFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpRangeFeed {
    /// # Errors
    ///
    /// Returns `Err` if the HTTP client cannot be constructed.
    pub fn new(config: &RangeFeedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("dcfw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl RangeFeed for HttpRangeFeed {
    async fn fetch(&self) -> Result<String> {
        info!("Fetching range feed from {}", self.url);
        let body = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

/// Ranges from the feed, partitioned by family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSets {
    pub v4: BTreeSet<Ipv4Network>,
    pub v6: BTreeSet<Ipv6Network>,
    /// Entries skipped as malformed
    pub rejected: Vec<String>,
}

impl RangeSets {
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extracts and merges the string entries of every requested category.
///
/// Missing categories contribute nothing.
///
/// # Errors
///
/// Returns `Err` if the body is not JSON or its top level is not an object.
pub fn parse_range_feed(body: &str, categories: &[String]) -> Result<BTreeSet<String>> {
    let doc: Value = serde_json::from_str(body)?;
    let object = doc
        .as_object()
        .ok_or_else(|| Error::Internal("range feed is not a JSON object".to_string()))?;

    let mut merged = BTreeSet::new();
    for category in categories {
        match object.get(category).and_then(Value::as_array) {
            Some(entries) => {
                merged.extend(entries.iter().filter_map(Value::as_str).map(str::to_string));
            }
            None => debug!("Range feed has no '{category}' array"),
        }
    }
    Ok(merged)
}

/// Partitions CIDR strings by family.
///
/// An entry containing `:` is IPv6, anything else IPv4. Entries without a
/// `/prefix`, or that fail to parse, are rejected with a warning. Host bits
/// are cleared so overlapping notations collapse to one range.
pub fn classify_ranges<I>(entries: I) -> RangeSets
where
    I: IntoIterator<Item = String>,
{
    let mut sets = RangeSets::default();
    for entry in entries {
        let entry = entry.trim().to_string();
        if !entry.contains('/') {
            warn!("skipping malformed range '{entry}': missing /prefix");
            sets.rejected.push(entry);
            continue;
        }

        if entry.contains(':') {
            match entry.parse::<Ipv6Network>() {
                Ok(net) => match Ipv6Network::new(net.network(), net.prefix()) {
                    Ok(net) => {
                        sets.v6.insert(net);
                    }
                    Err(e) => reject(&mut sets, entry, &e),
                },
                Err(e) => reject(&mut sets, entry, &e),
            }
        } else {
            match entry.parse::<Ipv4Network>() {
                Ok(net) => match Ipv4Network::new(net.network(), net.prefix()) {
                    Ok(net) => {
                        sets.v4.insert(net);
                    }
                    Err(e) => reject(&mut sets, entry, &e),
                },
                Err(e) => reject(&mut sets, entry, &e),
            }
        }
    }
    sets
}

fn reject(sets: &mut RangeSets, entry: String, error: &dyn std::fmt::Display) {
    warn!("skipping malformed range '{entry}': {error}");
    sets.rejected.push(entry);
}

/// Fetches, parses, and classifies the feed. Never fails: any error yields
/// an empty set and a warning.
pub async fn fetch_ranges(feed: &dyn RangeFeed, categories: &[String]) -> RangeSets {
    let body = match feed.fetch().await {
        Ok(body) => body,
        Err(e) => {
            warn!("range feed fetch failed ({e}), continuing without feed ranges");
            return RangeSets::default();
        }
    };

    let entries = match parse_range_feed(&body, categories) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("range feed parse failed ({e}), continuing without feed ranges");
            return RangeSets::default();
        }
    };

    let sets = classify_ranges(entries);
    info!(
        "Range feed: {} IPv4 ranges, {} IPv6 ranges, {} rejected",
        sets.v4.len(),
        sets.v6.len(),
        sets.rejected.len()
    );
    sets
}

/// Merges resolved domains and feed ranges into one allowlist
pub fn build_allowlist(resolutions: &[DomainResolution], ranges: &RangeSets) -> Allowlist {
    let mut allowlist = Allowlist::default();
    for resolution in resolutions {
        for address in resolution.addresses() {
            allowlist.add_host(address.addr);
        }
    }
    allowlist.nets_v4.extend(ranges.v4.iter().copied());
    allowlist.nets_v6.extend(ranges.v6.iter().copied());
    allowlist
}
