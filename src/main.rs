//! DCFW - Dev Container Firewall
//!
//! Runs once at container start, before the development workload. Resolves
//! the compiled-in allowlist, populates nftables address sets, installs a
//! default-deny egress chain per address family, prints a before/after diff
//! of the packet-filter state, and probes a few endpoints.
//!
//! # Usage
//!
//! ```bash
//! dcfw                                  # install (same as `dcfw apply`)
//! dcfw --no-range-feed                  # skip the published range feed
//! dcfw --audit-root /var/log/dcfw       # keep run directories elsewhere
//! dcfw --no-verify                      # skip reachability probes
//! dcfw plan                             # print the ruleset without touching the host
//! dcfw plan --explain 140.82.112.3      # which rule decides this destination
//! ```
//!
//! # Exit status
//!
//! Zero when rule installation succeeded. Verification probes never change
//! the exit status, and SIGINT or SIGTERM during verification only cuts it
//! short.

use clap::{Parser, Subcommand};
use dcfw::audit::AuditRecorder;
use dcfw::config::Config;
use dcfw::core::firewall::{Family, Packet, Protocol};
use dcfw::core::memory::MemoryFirewall;
use dcfw::core::nft_json::NftFirewall;
use dcfw::core::pipeline::Pipeline;
use dcfw::core::resolver::{HttpRangeFeed, SystemResolver};
use dcfw::core::state::{Artifact, FirewallState};
use dcfw::core::verify::Verifier;
use dcfw::elevation;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dcfw")]
#[command(version, about = "Egress-allowlisting firewall initializer for dev containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Do not fetch the published range feed
    #[arg(long, global = true)]
    no_range_feed: bool,

    /// Parent directory for per-run audit directories
    #[arg(long, global = true, value_name = "DIR")]
    audit_root: Option<PathBuf>,

    /// Skip post-install reachability probes
    #[arg(long, global = true)]
    no_verify: bool,

    /// Debug-level logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the egress allowlist on this host (default)
    Apply,
    /// Build the ruleset in memory and print it; the host is not modified
    Plan {
        /// Destination address to trace through the egress chain (tcp/443)
        #[arg(long, value_name = "IP")]
        explain: Vec<IpAddr>,
    },
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if self.no_range_feed {
            config.range_feed.enabled = false;
        }
        if let Some(root) = &self.audit_root {
            config.audit_root.clone_from(root);
        }
        if self.no_verify {
            config.verify.enabled = false;
        }
        config
    }

    fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Targets stay on so every line names its component
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_max_level(cli.log_level())
        .init();

    let mut config = cli.config();
    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Commands::Apply) {
        Commands::Apply => runtime.block_on(apply(&config)),
        Commands::Plan { explain } => runtime.block_on(plan(&config, &explain)),
    }
}

fn range_feed(config: &Config) -> Option<HttpRangeFeed> {
    if !config.range_feed.enabled {
        return None;
    }
    match HttpRangeFeed::new(&config.range_feed) {
        Ok(feed) => Some(feed),
        Err(e) => {
            warn!("Range feed client unavailable, continuing without it: {e}");
            None
        }
    }
}

fn report_error(e: &dcfw::Error) {
    error!("Installation failed: {e}");
    if let dcfw::Error::Nftables {
        stderr: Some(stderr),
        ..
    } = e
    {
        eprintln!("{}", stderr.trim_end());
    }
    if let Some(translation) = e.translate() {
        eprintln!("\n{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See: {url}");
        }
    }
}

async fn apply(config: &Config) -> ExitCode {
    let state = NftFirewall::new(&config.names);
    let resolver = SystemResolver;
    let feed = range_feed(config);
    let mut pipeline = Pipeline::new(config, &state, &resolver);
    if let Some(feed) = &feed {
        pipeline = pipeline.with_feed(feed);
    }

    let work = async {
        elevation::check_privileges()?;
        pipeline.install().await
    };
    let recorder = AuditRecorder::new(&config.audit_root, config);
    let bracketed = recorder.bracket(&state, work, shutdown_signal()).await;

    bracketed.report.print();

    let report = match bracketed.outcome {
        Ok(report) => report,
        Err(e) => {
            report_error(&e);
            return ExitCode::FAILURE;
        }
    };

    for family in &report.skipped {
        warn!("{} egress is not filtered on this host", family.label());
    }
    info!(
        "Egress allowlist installed ({} chains, {} addresses)",
        report.chains.len(),
        report.allowlist.len()
    );

    if config.verify.enabled {
        match Verifier::from_config(&config.verify) {
            Ok(verifier) => {
                verifier
                    .run_until(&config.verify.targets, shutdown_signal())
                    .await;
            }
            Err(e) => warn!("Verification skipped: {e}"),
        }
    } else {
        info!("Verification disabled");
    }

    ExitCode::SUCCESS
}

async fn plan(config: &Config, explain: &[IpAddr]) -> ExitCode {
    let state = MemoryFirewall::with_table(config.names.table.clone());
    let resolver = SystemResolver;
    let feed = range_feed(config);
    let mut pipeline = Pipeline::new(config, &state, &resolver);
    if let Some(feed) = &feed {
        pipeline = pipeline.with_feed(feed);
    }

    if let Err(e) = pipeline.install().await {
        report_error(&e);
        return ExitCode::FAILURE;
    }

    for family in [Family::V4, Family::V6] {
        if let Some(listing) = state.capture(Artifact::rules_listing(family)).await {
            println!("{listing}");
        }
    }

    for addr in explain {
        let family = Family::of(addr);
        let packet = Packet::new(*addr, Protocol::Tcp, 443);
        let Some((chain, verdict)) = state.evaluate(family, &packet) else {
            println!("{addr} tcp/443: no {} ruleset", family.label());
            continue;
        };
        let rule = verdict
            .rule
            .and_then(|idx| state.chain(family, &chain)?.get(idx).cloned());
        match rule {
            Some(rule) => println!(
                "{addr} tcp/443: {} by {chain} rule \"{}\"",
                verdict.action, rule.comment
            ),
            None => println!("{addr} tcp/443: {} by {chain} policy", verdict.action),
        }
    }

    ExitCode::SUCCESS
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Cannot install signal handlers; a signal will skip the audit diff");
        std::future::pending::<()>().await;
        return;
    };

    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}
