//! In-memory [`FirewallState`] used by plan mode and tests
//!
//! Mirrors the nft object model closely enough to evaluate packets: one table
//! per family with address sets, regular chains, an output hook holding jumps,
//! and an input hook holding the inbound exceptions. Individual operations can
//! be made to fail, and a family can be marked missing.

use crate::core::address::{AddressSet, SetKind};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Action, Family, Packet, Rule, RuleChain, Verdict, display_net};
use crate::core::nft_json;
use crate::core::state::{Artifact, FirewallState};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutating operations that can be set up to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum Operation {
    EnsureSet,
    FlushSet,
    AddElement,
    EnsureChain,
    FlushChain,
    AppendRule,
    AttachChain,
    InputRule,
}

#[derive(Debug, Default, Clone)]
struct Table {
    sets: BTreeMap<String, (AddressSet, BTreeSet<IpNetwork>)>,
    chains: BTreeMap<String, Vec<Rule>>,
    /// Jump targets of the output hook, head first
    output: Vec<String>,
    input: Vec<Rule>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<Family, Table>,
    missing: BTreeSet<Family>,
    faults: BTreeSet<Operation>,
}

#[derive(Debug)]
pub struct MemoryFirewall {
    table_name: String,
    inner: Mutex<Inner>,
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::with_table("dcfw")
    }

    pub fn with_table(name: impl Into<String>) -> Self {
        Self {
            table_name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Marks `family` as absent on this host.
    pub fn without_family(self, family: Family) -> Self {
        self.lock().missing.insert(family);
        self
    }

    /// Makes every later `op` fail with an nft error.
    pub fn fail_on(self, op: Operation) -> Self {
        self.inject(op);
        self
    }

    pub fn inject(&self, op: Operation) {
        self.lock().faults.insert(op);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Rules of a regular chain, `None` if it does not exist
    pub fn chain(&self, family: Family, name: &str) -> Option<Vec<Rule>> {
        self.lock()
            .tables
            .get(&family)
            .and_then(|t| t.chains.get(name).cloned())
    }

    /// Members of the named set in either family, sorted
    pub fn set_members(&self, name: &str) -> Vec<IpNetwork> {
        self.lock()
            .tables
            .values()
            .filter_map(|t| t.sets.get(name))
            .flat_map(|(_, members)| members.iter().copied())
            .collect()
    }

    /// Jump targets in the output hook, head first
    pub fn attachments(&self, family: Family) -> Vec<String> {
        self.lock()
            .tables
            .get(&family)
            .map(|t| t.output.clone())
            .unwrap_or_default()
    }

    pub fn input_rules(&self, family: Family) -> Vec<Rule> {
        self.lock()
            .tables
            .get(&family)
            .map(|t| t.input.clone())
            .unwrap_or_default()
    }

    /// Runs `packet` through the output hook of `family`.
    ///
    /// Each jumped-to chain is evaluated in hook order; the first chain with a
    /// matching rule decides. Otherwise the hook's accept policy applies.
    pub fn evaluate(&self, family: Family, packet: &Packet) -> Option<(String, Verdict)> {
        let inner = self.lock();
        let table = inner.tables.get(&family)?;
        let membership = |set: &str, addr: IpAddr| {
            table.sets.get(set).is_some_and(|(_, members)| {
                members.iter().any(|net| net.contains(addr))
            })
        };

        for target in &table.output {
            let Some(rules) = table.chains.get(target) else {
                continue;
            };
            let chain = RuleChain {
                family,
                name: target.clone(),
                rules: rules.clone(),
            };
            let verdict = chain.verdict(packet, &membership);
            if verdict.rule.is_some() {
                return Some((target.clone(), verdict));
            }
        }
        Some((
            "output".to_string(),
            Verdict {
                rule: None,
                action: Action::Accept,
            },
        ))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks, checks the fault list, and hands out the family's table.
    fn with_table_mut<T>(
        &self,
        family: Family,
        op: Operation,
        f: impl FnOnce(&mut Table) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        if inner.missing.contains(&family) {
            return Err(Error::FamilyUnavailable(family));
        }
        if inner.faults.contains(&op) {
            return Err(Error::Nftables {
                message: format!("Operation not permitted ({op})"),
                stderr: Some("Error: Could not process rule: Operation not permitted".to_string()),
                exit_code: Some(1),
            });
        }
        f(inner.tables.entry(family).or_default())
    }

    fn render_listing(&self, family: Family, table: &Table) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "table {} {} {{", family.nft_family(), self.table_name);
        for (set, members) in table.sets.values() {
            out.push_str(&indent(&render_set(set, members)));
        }
        for (name, rules) in &table.chains {
            let chain = RuleChain {
                family,
                name: name.clone(),
                rules: rules.clone(),
            };
            out.push_str(&indent(&chain.to_nft_text()));
        }
        let _ = writeln!(out, "    chain output {{");
        let _ = writeln!(out, "        type filter hook output priority filter; policy accept;");
        for target in &table.output {
            let _ = writeln!(out, "        jump {target}");
        }
        out.push_str("    }\n");
        let _ = writeln!(out, "    chain input {{");
        let _ = writeln!(out, "        type filter hook input priority filter; policy accept;");
        for rule in &table.input {
            let _ = writeln!(out, "        {}", rule.to_nft_text(family));
        }
        out.push_str("    }\n}\n");
        out
    }

    fn render_json(&self, family: Family, table: &Table) -> Value {
        let name = self.table_name.as_str();
        let mut items = vec![json!({ "table": { "family": family.nft_family(), "name": name } })];
        for (set, members) in table.sets.values() {
            let mut body = nft_json::set_object(name, set);
            if !members.is_empty() {
                body["elem"] = Value::Array(members.iter().map(nft_json::element).collect());
            }
            items.push(json!({ "set": body }));
        }
        for (chain, rules) in &table.chains {
            items.push(json!({ "chain": { "family": family.nft_family(), "table": name, "name": chain } }));
            for rule in rules {
                items.push(json!({ "rule": nft_json::rule_object(name, family, chain, rule) }));
            }
        }
        json!({ "nftables": items })
    }
}

fn render_set(set: &AddressSet, members: &BTreeSet<IpNetwork>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "set {} {{", set.name);
    let _ = writeln!(out, "    type {}", set.family.addr_type());
    if set.kind == SetKind::Net {
        let _ = writeln!(out, "    flags interval");
    }
    if !members.is_empty() {
        let elements: Vec<String> = members.iter().map(display_net).collect();
        let _ = writeln!(out, "    elements = {{ {} }}", elements.join(", "));
    }
    out.push_str("}\n");
    out
}

fn indent(text: &str) -> String {
    text.lines().fold(String::new(), |mut out, line| {
        let _ = writeln!(out, "    {line}");
        out
    })
}

#[async_trait]
impl FirewallState for MemoryFirewall {
    async fn family_available(&self, family: Family) -> bool {
        let mut inner = self.lock();
        if inner.missing.contains(&family) {
            return false;
        }
        inner.tables.entry(family).or_default();
        true
    }

    async fn ensure_set(&self, set: &AddressSet) -> Result<()> {
        self.with_table_mut(set.family, Operation::EnsureSet, |t| {
            t.sets
                .entry(set.name.clone())
                .or_insert_with(|| (set.clone(), BTreeSet::new()));
            Ok(())
        })
    }

    async fn flush_set(&self, set: &AddressSet) -> Result<()> {
        self.with_table_mut(set.family, Operation::FlushSet, |t| {
            match t.sets.get_mut(&set.name) {
                Some((_, members)) => {
                    members.clear();
                    Ok(())
                }
                None => Err(no_such("set", &set.name)),
            }
        })
    }

    async fn add_element(&self, set: &AddressSet, element: IpNetwork) -> Result<()> {
        self.with_table_mut(set.family, Operation::AddElement, |t| {
            match t.sets.get_mut(&set.name) {
                Some((_, members)) => {
                    members.insert(element);
                    Ok(())
                }
                None => Err(no_such("set", &set.name)),
            }
        })
    }

    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<()> {
        self.with_table_mut(family, Operation::EnsureChain, |t| {
            t.chains.entry(chain.to_string()).or_default();
            Ok(())
        })
    }

    async fn flush_chain(&self, family: Family, chain: &str) -> Result<()> {
        self.with_table_mut(family, Operation::FlushChain, |t| {
            match t.chains.get_mut(chain) {
                Some(rules) => {
                    rules.clear();
                    Ok(())
                }
                None => Err(no_such("chain", chain)),
            }
        })
    }

    async fn append_rule(&self, family: Family, chain: &str, rule: &Rule) -> Result<()> {
        self.with_table_mut(family, Operation::AppendRule, |t| {
            match t.chains.get_mut(chain) {
                Some(rules) => {
                    rules.push(rule.clone());
                    Ok(())
                }
                None => Err(no_such("chain", chain)),
            }
        })
    }

    async fn detach_chain(&self, family: Family, chain: &str) -> usize {
        let mut inner = self.lock();
        let Some(table) = inner.tables.get_mut(&family) else {
            return 0;
        };
        let before = table.output.len();
        table.output.retain(|target| target != chain);
        before - table.output.len()
    }

    async fn attach_chain(&self, family: Family, chain: &str) -> Result<()> {
        self.with_table_mut(family, Operation::AttachChain, |t| {
            if !t.chains.contains_key(chain) {
                return Err(no_such("chain", chain));
            }
            t.output.insert(0, chain.to_string());
            Ok(())
        })
    }

    async fn ensure_input_rule(&self, family: Family, rule: &Rule) -> Result<bool> {
        self.with_table_mut(family, Operation::InputRule, |t| {
            if t.input.iter().any(|r| r.comment == rule.comment) {
                return Ok(false);
            }
            t.input.push(rule.clone());
            Ok(true)
        })
    }

    async fn capture(&self, artifact: Artifact) -> Option<String> {
        let inner = self.lock();
        let family_text = |family: Family, json: bool| {
            if inner.missing.contains(&family) {
                return None;
            }
            let Some(table) = inner.tables.get(&family) else {
                return Some(String::new());
            };
            Some(if json {
                self.render_json(family, table).to_string()
            } else {
                self.render_listing(family, table)
            })
        };

        match artifact {
            Artifact::RulesetV4 => family_text(Family::V4, true),
            Artifact::RulesetV6 => family_text(Family::V6, true),
            Artifact::RulesListingV4 => family_text(Family::V4, false),
            Artifact::RulesListingV6 => family_text(Family::V6, false),
            Artifact::Sets => {
                let sets: Vec<Value> = inner
                    .tables
                    .values()
                    .flat_map(|t| t.sets.values())
                    .map(|(set, members)| {
                        let mut body = nft_json::set_object(&self.table_name, set);
                        body["elem"] = Value::Array(members.iter().map(nft_json::element).collect());
                        json!({ "set": body })
                    })
                    .collect();
                Some(json!({ "nftables": sets }).to_string())
            }
            Artifact::SetsListing => Some(
                inner
                    .tables
                    .values()
                    .flat_map(|t| t.sets.values())
                    .map(|(set, members)| render_set(set, members))
                    .collect(),
            ),
            // No routing table in memory
            Artifact::RoutesV4 | Artifact::RoutesV6 => None,
        }
    }
}

fn no_such(kind: &str, name: &str) -> Error {
    Error::Nftables {
        message: format!("No such {kind}: {name}"),
        stderr: Some("Error: No such file or directory".to_string()),
        exit_code: Some(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Match, Protocol};

    fn hosts() -> AddressSet {
        AddressSet::new("allowed_hosts_v4", SetKind::Host, Family::V4)
    }

    #[tokio::test]
    async fn test_missing_family() {
        let fw = MemoryFirewall::new().without_family(Family::V6);
        assert!(fw.family_available(Family::V4).await);
        assert!(!fw.family_available(Family::V6).await);
        assert!(fw.capture(Artifact::RulesListingV6).await.is_none());

        let set = AddressSet::new("allowed_hosts_v6", SetKind::Host, Family::V6);
        assert!(matches!(
            fw.ensure_set(&set).await,
            Err(Error::FamilyUnavailable(Family::V6))
        ));
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let fw = MemoryFirewall::new().fail_on(Operation::EnsureChain);
        let err = fw.ensure_chain(Family::V4, "egress_allow").await.unwrap_err();
        assert!(matches!(err, Error::Nftables { .. }));

        fw.clear_faults();
        assert!(fw.ensure_chain(Family::V4, "egress_allow").await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_absent_chain_is_zero() {
        let fw = MemoryFirewall::new();
        assert_eq!(fw.detach_chain(Family::V4, "egress_allow").await, 0);
    }

    #[tokio::test]
    async fn test_evaluate_uses_set_membership() {
        let fw = MemoryFirewall::new();
        fw.ensure_set(&hosts()).await.unwrap();
        fw.add_element(&hosts(), "1.2.3.4/32".parse().unwrap())
            .await
            .unwrap();
        fw.ensure_chain(Family::V4, "egress_allow").await.unwrap();
        let chain = RuleChain {
            family: Family::V4,
            name: "egress_allow".to_string(),
            rules: vec![
                Rule::accept("hosts", Match::DestinationInSet("allowed_hosts_v4".to_string())),
                Rule::drop("default deny"),
            ],
        };
        fw.replace_chain(&chain).await.unwrap();
        fw.attach_chain(Family::V4, "egress_allow").await.unwrap();

        let allowed = Packet::new("1.2.3.4".parse().unwrap(), Protocol::Tcp, 443);
        let denied = Packet::new("5.6.7.8".parse().unwrap(), Protocol::Tcp, 443);

        let (_, verdict) = fw.evaluate(Family::V4, &allowed).unwrap();
        assert_eq!(verdict.action, Action::Accept);
        let (_, verdict) = fw.evaluate(Family::V4, &denied).unwrap();
        assert_eq!(verdict.action, Action::Drop);
        assert_eq!(verdict.rule, Some(1));
    }

    #[tokio::test]
    async fn test_listing_contains_set_elements() {
        let fw = MemoryFirewall::new();
        fw.ensure_set(&hosts()).await.unwrap();
        fw.add_element(&hosts(), "1.2.3.4/32".parse().unwrap())
            .await
            .unwrap();

        let listing = fw.capture(Artifact::SetsListing).await.unwrap();
        assert!(listing.contains("set allowed_hosts_v4"));
        assert!(listing.contains("elements = { 1.2.3.4 }"));

        let dump: Value = serde_json::from_str(&fw.capture(Artifact::Sets).await.unwrap()).unwrap();
        assert_eq!(dump["nftables"][0]["set"]["elem"][0], "1.2.3.4");
    }
}
