//! Integration tests for DCFW
//!
//! End-to-end installs against the in-memory firewall, plus one run of the
//! nftables backend against the mock nft script.
//!
//! # Running with Mock
//!
//! The nftables backend test drives `tests/mock_nft.sh` through
//! `DCFW_NFT_COMMAND` and needs no privileges:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use dcfw::audit::AuditRecorder;
use dcfw::config::Config;
use dcfw::core::firewall::{Action, CtState, Family, Packet, Protocol};
use dcfw::core::memory::{MemoryFirewall, Operation};
use dcfw::core::nft_json::NftFirewall;
use dcfw::core::pipeline::Pipeline;
use dcfw::core::resolver::{NameResolver, RangeFeed};
use dcfw::core::state::Artifact;
use dcfw::{Error, Result};
use ipnetwork::IpNetwork;
use proptest::prelude::*;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Default)]
struct StaticResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    fn with(mut self, domain: &str, addrs: &[&str]) -> Self {
        let parsed = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.answers.insert(domain.to_string(), parsed);
        self
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup(&self, domain: &str) -> std::io::Result<Vec<IpAddr>> {
        self.answers.get(domain).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no answer for {domain}"))
        })
    }
}

struct StaticFeed(&'static str);

#[async_trait]
impl RangeFeed for StaticFeed {
    async fn fetch(&self) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Default config minus the network and the host's real `/proc` files
fn offline_config(root: &Path, domains: &[&str]) -> Config {
    let mut config = Config {
        allowed_domains: domains.iter().map(ToString::to_string).collect(),
        resolv_conf: root.join("resolv.conf"),
        route_table_v4: root.join("route"),
        route_table_v6: root.join("ipv6_route"),
        audit_root: root.join("audit"),
        ..Config::default()
    };
    config.range_feed.enabled = false;
    config
}

fn resolver() -> StaticResolver {
    StaticResolver::default()
        .with("registry.example.com", &["192.0.2.10", "2001:db8::10"])
        .with("api.example.com", &["192.0.2.20"])
}

fn https(addr: &str) -> Packet {
    Packet::new(addr.parse().unwrap(), Protocol::Tcp, 443)
}

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_reinstall_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(tmp.path(), &["registry.example.com", "api.example.com"]);
    let fw = MemoryFirewall::new();
    let resolver = resolver();
    let pipeline = Pipeline::new(&config, &fw, &resolver);

    pipeline.install().await.unwrap();
    let first_chain = fw.chain(Family::V4, "egress_allow").unwrap();
    let first_hosts = fw.set_members("allowed_hosts_v4");

    pipeline.install().await.unwrap();

    assert_eq!(fw.chain(Family::V4, "egress_allow").unwrap(), first_chain);
    assert_eq!(fw.set_members("allowed_hosts_v4"), first_hosts);
    for family in [Family::V4, Family::V6] {
        assert_eq!(fw.attachments(family), vec!["egress_allow".to_string()]);
        assert_eq!(fw.input_rules(family).len(), 2);
    }
}

#[tokio::test]
async fn test_first_match_and_default_deny() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(tmp.path(), &["registry.example.com"]);
    let fw = MemoryFirewall::new();
    let resolver = resolver();

    let report = Pipeline::new(&config, &fw, &resolver).install().await.unwrap();
    let chain = report.chain(Family::V4).unwrap();
    assert_eq!(chain.rules.last().unwrap().action, Action::Drop);

    let (target, verdict) = fw.evaluate(Family::V4, &https("192.0.2.10")).unwrap();
    assert_eq!(target, "egress_allow");
    assert_eq!(verdict.action, Action::Accept);
    assert_eq!(chain.rules[verdict.rule.unwrap()].comment, "allowed hosts");

    let (_, verdict) = fw.evaluate(Family::V4, &https("203.0.113.7")).unwrap();
    assert_eq!(verdict.action, Action::Drop);
    assert_eq!(verdict.rule, Some(chain.rules.len() - 1));

    // Loopback wins before the allowlist is consulted
    let (_, verdict) = fw
        .evaluate(Family::V4, &https("203.0.113.7").on_interface("lo"))
        .unwrap();
    assert_eq!(verdict.rule, Some(0));

    let dns = Packet::new("127.0.0.11".parse().unwrap(), Protocol::Udp, 53);
    assert_eq!(fw.evaluate(Family::V4, &dns).unwrap().1.action, Action::Accept);
    let not_dns = Packet::new("127.0.0.11".parse().unwrap(), Protocol::Tcp, 80);
    assert_eq!(fw.evaluate(Family::V4, &not_dns).unwrap().1.action, Action::Drop);

    let (_, verdict) = fw.evaluate(Family::V6, &https("2001:db8::10")).unwrap();
    assert_eq!(verdict.action, Action::Accept);
    let (_, verdict) = fw.evaluate(Family::V6, &https("2001:db8::99")).unwrap();
    assert_eq!(verdict.action, Action::Drop);
}

fn installed_firewall() -> &'static MemoryFirewall {
    static FIREWALL: OnceLock<MemoryFirewall> = OnceLock::new();
    FIREWALL.get_or_init(|| {
        let tmp = tempfile::tempdir().unwrap();
        let config = offline_config(tmp.path(), &["registry.example.com"]);
        let fw = MemoryFirewall::new();
        let resolver = resolver();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(Pipeline::new(&config, &fw, &resolver).install())
            .unwrap();
        fw
    })
}

proptest! {
    #[test]
    fn prop_unlisted_ipv4_is_dropped(raw in any::<u32>(), port in 1u16..=u16::MAX) {
        let addr = Ipv4Addr::from(raw);
        prop_assume!(addr != Ipv4Addr::new(192, 0, 2, 10));
        // The embedded resolver is open on port 53
        prop_assume!(addr != Ipv4Addr::new(127, 0, 0, 11));

        let packet = Packet::new(IpAddr::V4(addr), Protocol::Tcp, port);
        let (_, verdict) = installed_firewall().evaluate(Family::V4, &packet).unwrap();
        prop_assert_eq!(verdict.action, Action::Drop);
    }

    #[test]
    fn prop_established_traffic_always_passes(raw in any::<u32>()) {
        let packet = Packet::new(IpAddr::V4(Ipv4Addr::from(raw)), Protocol::Tcp, 443)
            .with_state(CtState::Established);
        let (_, verdict) = installed_firewall().evaluate(Family::V4, &packet).unwrap();
        prop_assert_eq!(verdict.action, Action::Accept);
    }
}

#[tokio::test]
async fn test_failed_domain_does_not_abort_install() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(
        tmp.path(),
        &["registry.example.com", "gone.example.com", "api.example.com"],
    );
    let fw = MemoryFirewall::new();
    let resolver = resolver();

    let report = Pipeline::new(&config, &fw, &resolver).install().await.unwrap();

    assert_eq!(report.allowlist.hosts_v4.len(), 2);
    assert_eq!(
        fw.set_members("allowed_hosts_v4"),
        vec![net("192.0.2.10/32"), net("192.0.2.20/32")]
    );
}

#[tokio::test]
async fn test_malformed_ranges_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = offline_config(tmp.path(), &[]);
    config.range_feed.enabled = true;
    let fw = MemoryFirewall::new();
    let resolver = StaticResolver::default();
    let feed = StaticFeed(
        r#"{
            "web": ["140.82.112.0/20", "192.30.252.153", "2606:50c0::/32"],
            "api": ["140.82.112.0/20", "999.1.2.0/24"],
            "git": ["2a0a:a440::/29", "not-a-range"],
            "hooks": ["198.51.100.0/24"]
        }"#,
    );

    Pipeline::new(&config, &fw, &resolver)
        .with_feed(&feed)
        .install()
        .await
        .unwrap();

    assert_eq!(fw.set_members("allowed_nets_v4"), vec![net("140.82.112.0/20")]);
    assert_eq!(
        fw.set_members("allowed_nets_v6"),
        vec![net("2606:50c0::/32"), net("2a0a:a440::/29")]
    );

    let (_, verdict) = fw.evaluate(Family::V4, &https("140.82.114.4")).unwrap();
    assert_eq!(verdict.action, Action::Accept);
    let (_, verdict) = fw.evaluate(Family::V4, &https("198.51.100.1")).unwrap();
    assert_eq!(verdict.action, Action::Drop);
}

#[tokio::test]
async fn test_gateway_subnet_is_widened_to_24() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("route"),
        "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
         eth0\t00000000\t0205000A\t0003\t0\t0\t0\t00000000\t0\t0\t0\n",
    )
    .unwrap();
    let config = offline_config(tmp.path(), &[]);
    let fw = MemoryFirewall::new();
    let resolver = StaticResolver::default();

    let report = Pipeline::new(&config, &fw, &resolver).install().await.unwrap();

    assert_eq!(report.host.gateway_exception(Family::V4), Some(net("10.0.5.0/24")));
    let chain = report.chain(Family::V4).unwrap();
    assert!(chain.rules.iter().any(|r| r.comment == "host subnet 10.0.5.0/24"));

    let (_, verdict) = fw.evaluate(Family::V4, &https("10.0.5.200")).unwrap();
    assert_eq!(verdict.action, Action::Accept);
    let (_, verdict) = fw.evaluate(Family::V4, &https("10.0.6.1")).unwrap();
    assert_eq!(verdict.action, Action::Drop);
}

#[tokio::test]
async fn test_missing_gateway_omits_exception() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(tmp.path(), &["api.example.com"]);
    let fw = MemoryFirewall::new();
    let resolver = resolver();

    let report = Pipeline::new(&config, &fw, &resolver).install().await.unwrap();

    for family in [Family::V4, Family::V6] {
        let chain = report.chain(family).unwrap();
        assert!(
            !chain
                .rules
                .iter()
                .any(|r| r.comment.starts_with("host subnet") || r.comment == "gateway ip")
        );
        assert_eq!(chain.rules.last().unwrap().comment, "default deny");
    }
}

#[tokio::test]
async fn test_ipv6_unavailable_installs_ipv4_only() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(tmp.path(), &["registry.example.com"]);
    let fw = MemoryFirewall::new().without_family(Family::V6);
    let resolver = resolver();

    let report = Pipeline::new(&config, &fw, &resolver).install().await.unwrap();

    assert_eq!(report.skipped, vec![Family::V6]);
    assert_eq!(report.chains.len(), 1);
    assert!(report.chain(Family::V6).is_none());
    assert!(fw.evaluate(Family::V6, &https("2001:db8::10")).is_none());
    assert_eq!(fw.attachments(Family::V4), vec!["egress_allow".to_string()]);
}

#[tokio::test]
async fn test_failed_install_still_produces_audit_diff() {
    let tmp = tempfile::tempdir().unwrap();
    let config = offline_config(tmp.path(), &["registry.example.com"]);
    let fw = MemoryFirewall::new().fail_on(Operation::AppendRule);
    let resolver = resolver();
    let pipeline = Pipeline::new(&config, &fw, &resolver);
    let recorder = AuditRecorder::new(&config.audit_root, &config);

    let bracketed = recorder
        .bracket(&fw, pipeline.install(), std::future::pending())
        .await;

    assert!(matches!(bracketed.outcome, Err(Error::Nftables { .. })));
    let report = bracketed.report;
    assert!(!report.success);
    assert!(report.diff(Artifact::SetsListing).unwrap().added > 0);
    assert!(report.dir.starts_with(&config.audit_root));
    assert!(report.dir.join("before").is_dir());
    assert!(report.dir.join("after").is_dir());

    let rendered = report.render();
    assert!(rendered.contains("=== address sets"));
    assert!(rendered.contains("192.0.2.10"));
    assert!(rendered.contains(&format!("Full snapshots: {}", report.dir.display())));
}

fn mock_nft_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("mock_nft.sh")
}

#[tokio::test]
async fn test_nft_backend_against_mock() {
    let tmp = tempfile::tempdir().unwrap();
    let log = tmp.path().join("nft.log");
    unsafe {
        env::set_var("DCFW_NFT_COMMAND", format!("sh {}", mock_nft_path().display()));
        env::set_var("DCFW_IP_COMMAND", "true");
        env::set_var("DCFW_TEST_NO_ELEVATION", "1");
        env::set_var("MOCK_NFT_LOG", &log);
    }

    let config = offline_config(tmp.path(), &["registry.example.com"]);
    let fw = NftFirewall::new(&config.names);
    let resolver = resolver();
    let pipeline = Pipeline::new(&config, &fw, &resolver);
    let recorder = AuditRecorder::new(&config.audit_root, &config);

    let bracketed = recorder
        .bracket(&fw, pipeline.install(), std::future::pending())
        .await;
    let report = bracketed.outcome.unwrap();
    assert_eq!(report.chains.len(), 2);
    assert!(bracketed.report.success);
    assert!(bracketed.report.dir.join("before/ruleset-v4.txt").exists());

    let calls = std::fs::read_to_string(&log).unwrap();
    // The stale jump at handle 7 is removed before the new one is inserted
    assert!(calls.contains(r#""handle":7"#));
    assert!(calls.contains(r#""insert":{"rule""#));
    assert!(calls.contains(r#""comment":"dcfw egress""#));
    assert!(calls.contains(r#""flush":{"chain""#));
    assert!(calls.contains(r#""flags":["interval"]"#));
    assert!(calls.contains(r#""192.0.2.10""#));
    assert!(calls.contains("ARGS: -j -a list chain ip dcfw output"));
    assert!(calls.contains("ARGS: -j -a list chain ip6 dcfw input"));

    // Set captures carry elements; absent sets are not a capture failure
    assert!(calls.contains("ARGS: -j list set ip dcfw allowed_hosts_v4"));
    assert!(calls.contains("ARGS: list set ip6 dcfw allowed_nets_v6"));
    let after = bracketed.report.dir.join("after");
    let sets_json = std::fs::read_to_string(after.join(Artifact::Sets.file_name())).unwrap();
    assert!(sets_json.contains(r#""elem":["192.0.2.10"]"#));
    let sets_text = std::fs::read_to_string(after.join(Artifact::SetsListing.file_name())).unwrap();
    assert!(sets_text.contains("elements = { 192.0.2.10 }"));
}
