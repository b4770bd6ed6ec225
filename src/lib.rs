//! DCFW - Dev Container Firewall
//!
//! Egress-allowlisting firewall initializer for sandboxed development
//! containers. One run resolves the allowlist, populates nftables address
//! sets, installs a default-deny egress chain per address family, and records
//! the packet-filter state before and after.
//!
//! # Architecture
//!
//! - [`core`] - Resolver, address-set store, rule-chain builder and nftables backends
//! - [`audit`] - Before/after capture, diff report and run manifest
//! - [`validators`] - Domain and nft object-name validation
//! - [`config`] - Static allowlist and runtime settings
//! - [`elevation`] - Building `nft`/`ip` commands with or without `sudo`
//! - [`utils`] - Private file and directory helpers for the audit directory
//!
//! # Safety Features
//!
//! - Every name reaching an nft command line is validated first
//! - The egress chain is replaced in a single nft transaction
//! - Audit "after" capture runs on success, failure and shutdown signal
//! - SHA-256 checksums of every captured artifact

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{Family, Rule, RuleChain};
