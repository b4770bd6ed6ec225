//! Core firewall logic
//!
//! - [`firewall`]: rule model, first-match evaluator and nft text rendering
//! - [`address`]: resolved addresses, the allowlist and address-set descriptors
//! - [`resolver`]: domain resolution and the published range feed
//! - [`host`]: resolver configuration and default-gateway discovery
//! - [`state`]: the [`state::FirewallState`] accessor trait and audit artifacts
//! - [`nft_json`]: nftables JSON backend
//! - [`memory`]: in-memory backend used by plan mode and tests
//! - [`sets`]: address-set store
//! - [`chain`]: egress rule-chain builder and installer
//! - [`pipeline`]: the end-to-end install
//! - [`verify`]: post-install reachability probes
//! - [`error`]: error types and nft error translation

pub mod address;
pub mod chain;
pub mod error;
pub mod firewall;
pub mod host;
pub mod memory;
pub mod nft_json;
pub mod pipeline;
pub mod resolver;
pub mod sets;
pub mod state;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
