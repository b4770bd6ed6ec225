//! Shared test utilities for core module tests
//!
//! Provides deterministic stand-ins for the system resolver and the range
//! feed. This module is only compiled in test mode.

use crate::config::Config;
use crate::core::error::{Error, Result};
use crate::core::resolver::{NameResolver, RangeFeed};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("DCFW_TEST_NO_ELEVATION");
/// }
/// // ... test with custom env state ...
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Resolver answering from a fixed table; unknown names fail like NXDOMAIN.
#[derive(Debug, Default)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, addrs: &[&str]) -> Self {
        let parsed = addrs
            .iter()
            .map(|a| a.parse().expect("test address must parse"))
            .collect();
        self.answers.insert(domain.to_string(), parsed);
        self
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup(&self, domain: &str) -> std::io::Result<Vec<IpAddr>> {
        self.answers.get(domain).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("failed to lookup address information: {domain}"),
            )
        })
    }
}

/// Range feed returning a canned body or a canned failure
#[derive(Debug)]
pub struct StaticFeed {
    response: std::result::Result<String, String>,
}

impl StaticFeed {
    pub fn body(body: &str) -> Self {
        Self {
            response: Ok(body.to_string()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
        }
    }
}

#[async_trait]
impl RangeFeed for StaticFeed {
    async fn fetch(&self) -> Result<String> {
        self.response.clone().map_err(Error::Internal)
    }
}

/// Default configuration with `domains`, no range feed and no host files,
/// so nothing reaches the network or the real `/proc`.
pub fn offline_config(domains: &[&str]) -> Config {
    let missing = PathBuf::from("/nonexistent/dcfw-test");
    Config {
        allowed_domains: domains.iter().map(ToString::to_string).collect(),
        resolv_conf: missing.join("resolv.conf"),
        route_table_v4: missing.join("route"),
        route_table_v6: missing.join("ipv6_route"),
        ..Config::default()
    }
}
