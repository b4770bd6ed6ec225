//! nftables JSON backend
//!
//! Every mutation is a JSON batch piped to `nft --json -f -`, so a batch is
//! applied as one transaction. Listings used for idempotency checks are read
//! with `nft -j -a list chain ...`; audit captures shell out to `nft list`
//! and `ip route`. Address sets are captured one by one with
//! `nft list set`, since `nft list sets` omits elements.
//!
//! The command builders are plain functions so they can be tested without
//! running `nft`.

use crate::config::NftNames;
use crate::core::address::{AddressSet, SetKind};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Action, Family, Match, Rule, RuleChain, max_prefix};
use crate::core::state::{Artifact, FirewallState};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// Comment carried by the jump rule in the output hook
pub const JUMP_COMMENT: &str = "dcfw egress";

/// Drives the host's nftables through the `nft` binary
#[derive(Debug, Clone)]
pub struct NftFirewall {
    table: String,
    /// Sets whose elements are captured for the audit
    sets: Vec<AddressSet>,
}

impl NftFirewall {
    pub fn new(names: &NftNames) -> Self {
        let sets = [Family::V4, Family::V6]
            .into_iter()
            .flat_map(|family| {
                let sets = names.family_sets(family);
                [sets.hosts, sets.nets]
            })
            .collect();
        Self {
            table: names.table.clone(),
            sets,
        }
    }

    /// Lists every owned set with its elements. A set that does not exist
    /// yet contributes nothing; `None` only if no set could be listed.
    async fn capture_sets(&self, json: bool) -> Option<String> {
        let mut listings = Vec::with_capacity(self.sets.len());
        let mut failed = 0;
        for set in &self.sets {
            let mut args = vec![
                "list",
                "set",
                set.family.nft_family(),
                self.table.as_str(),
                set.name.as_str(),
            ];
            if json {
                args.insert(0, "-j");
            }
            match run_nft(&args).await {
                Ok(text) => listings.push(text),
                Err(e) if is_missing_object(&e) => debug!("Set {set} not present"),
                Err(e) => {
                    debug!("Capture of set {set} failed: {e}");
                    failed += 1;
                }
            }
        }
        if failed == self.sets.len() {
            return None;
        }
        Some(if json {
            merge_set_listings(&listings)
        } else {
            listings.concat()
        })
    }

    /// Lists one chain of our table as JSON, with rule handles.
    async fn list_chain(&self, family: Family, chain: &str) -> Result<Value> {
        let stdout = run_nft(&[
            "-j",
            "-a",
            "list",
            "chain",
            family.nft_family(),
            &self.table,
            chain,
        ])
        .await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

/// Pipes `commands` to `nft --json -f -` as one batch.
pub async fn apply_batch(commands: Vec<Value>) -> Result<()> {
    let payload = serde_json::to_string(&json!({ "nftables": commands }))?;
    debug!("nft batch: {payload}");

    let mut child = crate::elevation::create_nft_command(&["--json", "-f", "-"])?
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn nft: {e}");
            Error::Internal(format!("Failed to spawn nft: {e}"))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::Nftables {
            message: first_line(&stderr),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

/// Runs `nft` with `args` and returns stdout.
pub async fn run_nft(args: &[&str]) -> Result<String> {
    let output = crate::elevation::create_nft_command(args)?.output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::Nftables {
            message: first_line(&stderr),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

async fn run_ip(args: &[&str]) -> Result<String> {
    let output = crate::elevation::create_ip_command(args).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::Internal(format!(
            "ip {} exited with {:?}",
            args.join(" "),
            output.status.code()
        )))
    }
}

fn is_missing_object(e: &Error) -> bool {
    matches!(e, Error::Nftables { stderr: Some(stderr), .. } if stderr.contains("No such file or directory"))
}

/// Joins the `set` objects of several `nft -j list set` outputs into one
/// `{"nftables": [...]}` document. Unparsable listings are skipped.
pub fn merge_set_listings(listings: &[String]) -> String {
    let sets: Vec<Value> = listings
        .iter()
        .filter_map(|text| match serde_json::from_str::<Value>(text) {
            Ok(listing) => Some(listing),
            Err(e) => {
                debug!("Ignoring unparsable set listing: {e}");
                None
            }
        })
        .flat_map(|listing| match listing.get("nftables") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
        .filter(|item| item.get("set").is_some())
        .collect();
    json!({ "nftables": sets }).to_string()
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("nft failed")
        .to_string()
}

pub fn table_cmd(verb: &str, family: Family, table: &str) -> Value {
    json!({ verb: { "table": { "family": family.nft_family(), "name": table } } })
}

/// Base chain hooked into `hook` with an accept policy
pub fn add_base_chain(family: Family, table: &str, hook: &str) -> Value {
    json!({
        "add": {
            "chain": {
                "family": family.nft_family(),
                "table": table,
                "name": hook,
                "type": "filter",
                "hook": hook,
                "prio": 0,
                "policy": "accept"
            }
        }
    })
}

pub fn chain_cmd(verb: &str, family: Family, table: &str, chain: &str) -> Value {
    json!({ verb: { "chain": { "family": family.nft_family(), "table": table, "name": chain } } })
}

/// Set declaration body; range sets get interval flags and auto-merge
pub fn set_object(table: &str, set: &AddressSet) -> Value {
    let mut body = json!({
        "family": set.family.nft_family(),
        "table": table,
        "name": set.name,
        "type": set.family.addr_type(),
    });
    if set.kind == SetKind::Net {
        body["flags"] = json!(["interval"]);
        body["auto-merge"] = json!(true);
    }
    body
}

pub fn add_set(table: &str, set: &AddressSet) -> Value {
    json!({ "add": { "set": set_object(table, set) } })
}

pub fn flush_set(table: &str, set: &AddressSet) -> Value {
    json!({
        "flush": {
            "set": { "family": set.family.nft_family(), "table": table, "name": set.name }
        }
    })
}

/// Set element: bare address for host prefixes, `prefix` object otherwise
pub fn element(net: &IpNetwork) -> Value {
    if net.prefix() == max_prefix(Family::of_network(net)) {
        json!(net.ip().to_string())
    } else {
        json!({ "prefix": { "addr": net.network().to_string(), "len": net.prefix() } })
    }
}

pub fn add_elements(table: &str, set: &AddressSet, elements: &[IpNetwork]) -> Value {
    json!({
        "add": {
            "element": {
                "family": set.family.nft_family(),
                "table": table,
                "name": set.name,
                "elem": elements.iter().map(element).collect::<Vec<_>>()
            }
        }
    })
}

fn meta_match(key: &str, value: &str) -> Value {
    json!({ "match": { "left": { "meta": { "key": key } }, "op": "==", "right": value } })
}

/// Expression list of one rule, verdict last
pub fn rule_expr(family: Family, rule: &Rule) -> Vec<Value> {
    let mut expr = Vec::new();
    match &rule.matcher {
        Match::Any => {}
        Match::OutputInterface(name) => expr.push(meta_match("oifname", name)),
        Match::InputInterface(name) => expr.push(meta_match("iifname", name)),
        Match::ConnState(states) => {
            let states: Vec<String> = states.iter().map(ToString::to_string).collect();
            expr.push(json!({
                "match": { "left": { "ct": { "key": "state" } }, "op": "==", "right": { "set": states } }
            }));
        }
        Match::Destination { net, service } => {
            expr.push(json!({
                "match": {
                    "left": { "payload": { "protocol": family.nft_family(), "field": "daddr" } },
                    "op": "==",
                    "right": element(net)
                }
            }));
            if let Some((proto, port)) = service {
                expr.push(json!({
                    "match": {
                        "left": { "payload": { "protocol": proto.to_string(), "field": "dport" } },
                        "op": "==",
                        "right": port
                    }
                }));
            }
        }
        Match::DestinationInSet(set) => {
            expr.push(json!({
                "match": {
                    "left": { "payload": { "protocol": family.nft_family(), "field": "daddr" } },
                    "op": "==",
                    "right": format!("@{set}")
                }
            }));
        }
    }
    expr.push(match rule.action {
        Action::Accept => json!({ "accept": null }),
        Action::Drop => json!({ "drop": null }),
    });
    expr
}

pub fn rule_object(table: &str, family: Family, chain: &str, rule: &Rule) -> Value {
    json!({
        "family": family.nft_family(),
        "table": table,
        "chain": chain,
        "expr": rule_expr(family, rule),
        "comment": rule.comment
    })
}

pub fn add_rule(table: &str, family: Family, chain: &str, rule: &Rule) -> Value {
    json!({ "add": { "rule": rule_object(table, family, chain, rule) } })
}

/// Flush plus every rule: the chain body is swapped in one transaction.
pub fn replace_chain_batch(table: &str, chain: &RuleChain) -> Vec<Value> {
    let mut batch = vec![chain_cmd("flush", chain.family, table, &chain.name)];
    batch.extend(
        chain
            .rules
            .iter()
            .map(|rule| add_rule(table, chain.family, &chain.name, rule)),
    );
    batch
}

/// `insert` without a position puts the rule at the head of the chain
pub fn insert_jump(table: &str, family: Family, target: &str) -> Value {
    json!({
        "insert": {
            "rule": {
                "family": family.nft_family(),
                "table": table,
                "chain": "output",
                "expr": [{ "jump": { "target": target } }],
                "comment": JUMP_COMMENT
            }
        }
    })
}

pub fn delete_rule(table: &str, family: Family, chain: &str, handle: u64) -> Value {
    json!({
        "delete": {
            "rule": { "family": family.nft_family(), "table": table, "chain": chain, "handle": handle }
        }
    })
}

fn listed_rules(listing: &Value) -> impl Iterator<Item = &Value> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("rule"))
}

/// Handles of every rule in `listing` that jumps to `target`
pub fn jump_handles(listing: &Value, target: &str) -> Vec<u64> {
    listed_rules(listing)
        .filter(|rule| {
            rule.get("expr")
                .and_then(Value::as_array)
                .is_some_and(|expr| {
                    expr.iter().any(|e| {
                        e.get("jump")
                            .and_then(|j| j.get("target"))
                            .and_then(Value::as_str)
                            == Some(target)
                    })
                })
        })
        .filter_map(|rule| rule.get("handle").and_then(Value::as_u64))
        .collect()
}

/// Comments of every rule in `listing`
pub fn rule_comments(listing: &Value) -> Vec<String> {
    listed_rules(listing)
        .filter_map(|rule| rule.get("comment").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl FirewallState for NftFirewall {
    async fn family_available(&self, family: Family) -> bool {
        let batch = vec![
            table_cmd("add", family, &self.table),
            add_base_chain(family, &self.table, "output"),
            add_base_chain(family, &self.table, "input"),
        ];
        match apply_batch(batch).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{} packet filter unavailable: {e}", family.label());
                false
            }
        }
    }

    async fn ensure_set(&self, set: &AddressSet) -> Result<()> {
        apply_batch(vec![add_set(&self.table, set)]).await
    }

    async fn flush_set(&self, set: &AddressSet) -> Result<()> {
        apply_batch(vec![flush_set(&self.table, set)]).await
    }

    async fn add_element(&self, set: &AddressSet, element: IpNetwork) -> Result<()> {
        apply_batch(vec![add_elements(&self.table, set, &[element])]).await
    }

    async fn add_elements(&self, set: &AddressSet, elements: &[IpNetwork]) -> Result<()> {
        apply_batch(vec![add_elements(&self.table, set, elements)]).await
    }

    async fn ensure_chain(&self, family: Family, chain: &str) -> Result<()> {
        apply_batch(vec![chain_cmd("add", family, &self.table, chain)]).await
    }

    async fn flush_chain(&self, family: Family, chain: &str) -> Result<()> {
        apply_batch(vec![chain_cmd("flush", family, &self.table, chain)]).await
    }

    async fn append_rule(&self, family: Family, chain: &str, rule: &Rule) -> Result<()> {
        apply_batch(vec![add_rule(&self.table, family, chain, rule)]).await
    }

    async fn replace_chain(&self, chain: &RuleChain) -> Result<()> {
        apply_batch(replace_chain_batch(&self.table, chain)).await
    }

    async fn detach_chain(&self, family: Family, chain: &str) -> usize {
        let listing = match self.list_chain(family, "output").await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("No output hook to detach from: {e}");
                return 0;
            }
        };
        let handles = jump_handles(&listing, chain);
        if handles.is_empty() {
            return 0;
        }
        let batch = handles
            .iter()
            .map(|h| delete_rule(&self.table, family, "output", *h))
            .collect();
        match apply_batch(batch).await {
            Ok(()) => handles.len(),
            Err(e) => {
                warn!("Could not remove stale jumps to {chain}: {e}");
                0
            }
        }
    }

    async fn attach_chain(&self, family: Family, chain: &str) -> Result<()> {
        apply_batch(vec![insert_jump(&self.table, family, chain)]).await
    }

    async fn ensure_input_rule(&self, family: Family, rule: &Rule) -> Result<bool> {
        let listing = self.list_chain(family, "input").await?;
        if rule_comments(&listing).contains(&rule.comment) {
            return Ok(false);
        }
        apply_batch(vec![add_rule(&self.table, family, "input", rule)]).await?;
        Ok(true)
    }

    async fn capture(&self, artifact: Artifact) -> Option<String> {
        let result = match artifact {
            Artifact::RulesetV4 => run_nft(&["-j", "list", "ruleset", "ip"]).await,
            Artifact::RulesetV6 => run_nft(&["-j", "list", "ruleset", "ip6"]).await,
            Artifact::RulesListingV4 => run_nft(&["list", "ruleset", "ip"]).await,
            Artifact::RulesListingV6 => run_nft(&["list", "ruleset", "ip6"]).await,
            Artifact::RoutesV4 => run_ip(&["-4", "route", "show", "table", "all"]).await,
            Artifact::RoutesV6 => run_ip(&["-6", "route", "show", "table", "all"]).await,
            Artifact::Sets => return self.capture_sets(true).await,
            Artifact::SetsListing => return self.capture_sets(false).await,
        };
        match result {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("Capture of {artifact} failed: {e}");
                None
            }
        }
    }
}
