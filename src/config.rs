//! Static configuration for the firewall initializer
//!
//! The allowlist is compiled in: there is no configuration file. The CLI can
//! only narrow behavior (disable the range feed or verification, move the
//! audit directory). The effective configuration is recorded in every audit
//! run directory as `config.json`.

use crate::core::address::{AddressSet, FamilySets, SetKind};
use crate::core::error::{Error, Result};
use crate::core::firewall::Family;
use crate::core::verify::{Expectation, ProbeTarget};
use crate::validators::{validate_domain, validate_object_name};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Domains the container may reach, resolved fresh on every run
pub const ALLOWED_DOMAINS: &[&str] = &[
    "registry.npmjs.org",
    "api.anthropic.com",
    "sentry.io",
    "statsig.anthropic.com",
    "statsig.com",
    "marketplace.visualstudio.com",
    "vscode.blob.core.windows.net",
    "update.code.visualstudio.com",
];

/// Published CIDR ranges of the code-hosting provider
pub const RANGE_FEED_URL: &str = "https://api.github.com/meta";

/// Container-runtime embedded DNS server
pub const EMBEDDED_DNS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 11);

/// Range feed settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeFeedConfig {
    pub enabled: bool,
    pub url: String,
    /// JSON array fields whose entries are merged
    pub categories: Vec<String>,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RangeFeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: RANGE_FEED_URL.to_string(),
            categories: vec!["web".to_string(), "api".to_string(), "git".to_string()],
            connect_timeout_secs: 5,
            timeout_secs: 10,
        }
    }
}

/// Names of the nftables objects dcfw owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftNames {
    pub table: String,
    pub egress_chain: String,
    pub hosts_v4: String,
    pub hosts_v6: String,
    pub nets_v4: String,
    pub nets_v6: String,
}

impl Default for NftNames {
    fn default() -> Self {
        Self {
            table: "dcfw".to_string(),
            egress_chain: "egress_allow".to_string(),
            hosts_v4: "allowed_hosts_v4".to_string(),
            hosts_v6: "allowed_hosts_v6".to_string(),
            nets_v4: "allowed_nets_v4".to_string(),
            nets_v6: "allowed_nets_v6".to_string(),
        }
    }
}

impl NftNames {
    /// The host and range sets for `family`
    pub fn family_sets(&self, family: Family) -> FamilySets {
        let (hosts, nets) = match family {
            Family::V4 => (&self.hosts_v4, &self.nets_v4),
            Family::V6 => (&self.hosts_v6, &self.nets_v6),
        };
        FamilySets {
            hosts: AddressSet::new(hosts.as_str(), SetKind::Host, family),
            nets: AddressSet::new(nets.as_str(), SetKind::Net, family),
        }
    }

    fn all(&self) -> [(&'static str, &str); 6] {
        [
            ("names.table", self.table.as_str()),
            ("names.egress_chain", self.egress_chain.as_str()),
            ("names.hosts_v4", self.hosts_v4.as_str()),
            ("names.hosts_v6", self.hosts_v6.as_str()),
            ("names.nets_v4", self.nets_v4.as_str()),
            ("names.nets_v6", self.nets_v6.as_str()),
        ]
    }
}

/// Post-install reachability probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    pub enabled: bool,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    pub targets: Vec<ProbeTarget>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout_secs: 5,
            timeout_secs: 10,
            targets: vec![
                ProbeTarget::new("package registry", "https://registry.npmjs.org"),
                ProbeTarget::new("update service", "https://update.code.visualstudio.com"),
                ProbeTarget::new("code hosting API", "https://api.github.com/zen"),
                ProbeTarget::new("AI service API", "https://api.anthropic.com"),
                ProbeTarget {
                    label: "blocked canary".to_string(),
                    url: "https://example.com".to_string(),
                    expect: Expectation::Blocked,
                },
            ],
        }
    }
}

/// Complete initializer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub allowed_domains: Vec<String>,
    pub range_feed: RangeFeedConfig,
    /// Resolvers always exempted, merged with the resolver config file
    pub stub_resolvers: Vec<IpAddr>,
    pub resolv_conf: PathBuf,
    pub route_table_v4: PathBuf,
    pub route_table_v6: PathBuf,
    pub names: NftNames,
    /// Parent directory of the per-run audit directories
    pub audit_root: PathBuf,
    pub verify: VerifyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_domains: ALLOWED_DOMAINS.iter().map(ToString::to_string).collect(),
            range_feed: RangeFeedConfig::default(),
            stub_resolvers: vec![IpAddr::V4(EMBEDDED_DNS)],
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            route_table_v4: PathBuf::from("/proc/net/route"),
            route_table_v6: PathBuf::from("/proc/net/ipv6_route"),
            names: NftNames::default(),
            audit_root: std::env::temp_dir(),
            verify: VerifyConfig::default(),
        }
    }
}

impl Config {
    /// Checks every name that reaches an nft command line and normalizes the
    /// domain list (lowercase, deduplicated, original order kept).
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for the first malformed domain or object name.
    pub fn validate(&mut self) -> Result<()> {
        let mut normalized: Vec<String> = Vec::with_capacity(self.allowed_domains.len());
        for domain in &self.allowed_domains {
            let name =
                validate_domain(domain).map_err(|msg| Error::validation("allowed_domains", msg))?;
            if !normalized.contains(&name) {
                normalized.push(name);
            }
        }
        self.allowed_domains = normalized;

        for (field, name) in self.names.all() {
            validate_object_name(name).map_err(|msg| Error::validation(field, msg))?;
        }

        if self.range_feed.enabled && self.range_feed.categories.is_empty() {
            return Err(Error::validation(
                "range_feed.categories",
                "at least one category is required when the feed is enabled",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.allowed_domains.len(), ALLOWED_DOMAINS.len());
    }

    #[test]
    fn test_validate_dedups_and_lowercases() {
        let mut config = Config {
            allowed_domains: vec![
                "Sentry.io".to_string(),
                "sentry.io".to_string(),
                "api.anthropic.com".to_string(),
            ],
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.allowed_domains, vec!["sentry.io", "api.anthropic.com"]);
    }

    #[test]
    fn test_validate_rejects_bad_domain() {
        let mut config = Config {
            allowed_domains: vec!["evil;rm -rf.com".to_string()],
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "allowed_domains"));
    }

    #[test]
    fn test_validate_rejects_bad_object_name() {
        let mut config = Config::default();
        config.names.egress_chain = "egress-allow".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_family_sets_use_configured_names() {
        let names = NftNames::default();
        let v6 = names.family_sets(Family::V6);
        assert_eq!(v6.hosts.name, "allowed_hosts_v6");
        assert_eq!(v6.nets.kind, SetKind::Net);
        assert_eq!(v6.nets.family, Family::V6);
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("registry.npmjs.org"));
        assert!(json.contains("api.github.com/meta"));
    }
}
