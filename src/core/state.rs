//! The live packet-filter state as an injected resource
//!
//! Rule chains and address sets are process-wide kernel state. Every read and
//! write goes through [`FirewallState`] so the pipeline never touches the
//! kernel directly:
//!
//! - [`crate::core::nft_json::NftFirewall`] drives the real `nft` binary
//! - [`crate::core::memory::MemoryFirewall`] keeps everything in memory for
//!   plan mode and tests
//!
//! Idempotency guards (`detach_chain`, `ensure_input_rule`) and audit captures
//! are best-effort and report through their return values, never through `Err`.

use crate::core::address::AddressSet;
use crate::core::error::Result;
use crate::core::firewall::{Family, Rule, RuleChain};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// One raw dump or human-readable listing captured by the audit recorder
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
pub enum Artifact {
    /// Full ruleset dump (JSON) for IPv4
    #[strum(serialize = "ruleset-v4.json")]
    RulesetV4,
    #[strum(serialize = "ruleset-v6.json")]
    RulesetV6,
    /// Human-readable ruleset listing for IPv4
    #[strum(serialize = "ruleset-v4.txt")]
    RulesListingV4,
    #[strum(serialize = "ruleset-v6.txt")]
    RulesListingV6,
    /// All address sets with their elements (JSON)
    #[strum(serialize = "sets.json")]
    Sets,
    #[strum(serialize = "sets.txt")]
    SetsListing,
    /// Routing (address) table for IPv4
    #[strum(serialize = "routes-v4.txt")]
    RoutesV4,
    #[strum(serialize = "routes-v6.txt")]
    RoutesV6,
}

impl Artifact {
    /// File name inside a snapshot directory
    pub fn file_name(self) -> String {
        self.to_string()
    }

    /// Heading used in the diff report
    pub const fn title(self) -> &'static str {
        match self {
            Artifact::RulesetV4 => "rule chain dump (IPv4)",
            Artifact::RulesetV6 => "rule chain dump (IPv6)",
            Artifact::RulesListingV4 => "rule chain (IPv4)",
            Artifact::RulesListingV6 => "rule chain (IPv6)",
            Artifact::Sets => "address set dump",
            Artifact::SetsListing => "address sets",
            Artifact::RoutesV4 => "routing table (IPv4)",
            Artifact::RoutesV6 => "routing table (IPv6)",
        }
    }

    /// Whether the diff of this artifact is printed in the run report.
    /// Every diff is still written to the audit directory.
    pub const fn reported(self) -> bool {
        matches!(
            self,
            Artifact::RulesListingV4 | Artifact::RulesListingV6 | Artifact::SetsListing
        )
    }

    pub const fn rules_listing(family: Family) -> Self {
        match family {
            Family::V4 => Artifact::RulesListingV4,
            Family::V6 => Artifact::RulesListingV6,
        }
    }
}

/// Accessor for the host's rule chains and address sets.
///
/// All objects live in one table per family; implementations create that
/// table on demand.
#[async_trait]
pub trait FirewallState: Send + Sync {
    /// Prepares the family's table. `false` means the family's packet filter
    /// is missing on this host.
    async fn family_available(&self, family: Family) -> bool;

    /// Creates the set if absent. No error if it already exists.
    async fn ensure_set(&self, set: &AddressSet) -> Result<()>;

    /// Removes every element. No error if the set was already empty.
    async fn flush_set(&self, set: &AddressSet) -> Result<()>;

    /// Inserts one element. Inserting an existing element is a no-op.
    async fn add_element(&self, set: &AddressSet, element: IpNetwork) -> Result<()>;

    /// Inserts many elements; backends override this to batch.
    async fn add_elements(&self, set: &AddressSet, elements: &[IpNetwork]) -> Result<()> {
        for element in elements {
            self.add_element(set, *element).await?;
        }
        Ok(())
    }

    /// Creates the regular (non-hooked) chain if absent.
    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<()>;

    async fn flush_chain(&self, family: Family, chain: &str) -> Result<()>;

    async fn append_rule(&self, family: Family, chain: &str, rule: &Rule) -> Result<()>;

    /// Flushes the chain and appends every rule of `chain` in order.
    /// Backends that support transactions make this atomic.
    async fn replace_chain(&self, chain: &RuleChain) -> Result<()> {
        self.flush_chain(chain.family, &chain.name).await?;
        for rule in &chain.rules {
            self.append_rule(chain.family, &chain.name, rule).await?;
        }
        Ok(())
    }

    /// Removes every jump from the outbound hook into `chain`. Returns the
    /// number removed; an absent hook or jump counts as zero.
    async fn detach_chain(&self, family: Family, chain: &str) -> usize;

    /// Inserts a jump into `chain` at the head of the outbound hook.
    async fn attach_chain(&self, family: Family, chain: &str) -> Result<()>;

    /// Adds `rule` to the inbound hook unless a rule with the same comment is
    /// already there. Returns whether it was added.
    async fn ensure_input_rule(&self, family: Family, rule: &Rule) -> Result<bool>;

    /// Captures one audit artifact. `None` when the capture is unavailable.
    async fn capture(&self, artifact: Artifact) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_artifact_file_names_are_unique() {
        let names: std::collections::BTreeSet<String> =
            Artifact::iter().map(Artifact::file_name).collect();
        assert_eq!(names.len(), Artifact::iter().count());
    }

    #[test]
    fn test_reported_artifacts() {
        let reported: Vec<Artifact> = Artifact::iter().filter(|a| a.reported()).collect();
        assert_eq!(
            reported,
            vec![
                Artifact::RulesListingV4,
                Artifact::RulesListingV6,
                Artifact::SetsListing
            ]
        );
    }
}
