//! Post-install reachability probes
//!
//! Each target gets one HEAD request with connect and total timeouts. Any
//! HTTP response, whatever its status, proves the path is open. The outcome
//! is diagnostic only: it is logged and summarized, never turned into an
//! error.

use crate::config::VerifyConfig;
use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// What a probe is expected to observe once the policy is live
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
pub enum Expectation {
    #[default]
    #[strum(serialize = "reachable")]
    Reachable,
    /// Canary outside the allowlist; reaching it means default-deny is not in effect
    #[strum(serialize = "blocked")]
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub expect: Expectation,
}

impl ProbeTarget {
    /// A target expected to be reachable
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            expect: Expectation::Reachable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub label: String,
    pub url: String,
    pub reachable: bool,
    pub expect: Expectation,
    /// HTTP status or transport error
    pub detail: String,
}

impl ProbeResult {
    pub fn passed(&self) -> bool {
        match self.expect {
            Expectation::Reachable => self.reachable,
            Expectation::Blocked => !self.reachable,
        }
    }
}

/// Aggregate of one verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyResult {
    pub probes: Vec<ProbeResult>,
}

impl VerifyResult {
    pub fn success(&self) -> bool {
        self.probes.iter().all(ProbeResult::passed)
    }

    pub fn failed(&self) -> usize {
        self.probes.iter().filter(|p| !p.passed()).count()
    }

    pub fn summary(&self) -> String {
        let total = self.probes.len();
        let passed = total - self.failed();
        if self.success() {
            format!("Verification summary: PASS ({passed}/{total} probes)")
        } else {
            format!("Verification summary: FAIL ({passed}/{total} probes)")
        }
    }
}

pub struct Verifier {
    client: reqwest::Client,
}

impl Verifier {
    /// # Errors
    ///
    /// Returns `Error::Http` if the HTTP client cannot be built.
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("dcfw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &VerifyConfig) -> Result<Self> {
        Self::new(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let (reachable, detail) = match self.client.head(&target.url).send().await {
            Ok(response) => (true, format!("HTTP {}", response.status().as_u16())),
            Err(e) if e.is_timeout() => (false, "timed out".to_string()),
            Err(e) if e.is_connect() => (false, "connection refused or unreachable".to_string()),
            Err(e) => (false, e.to_string()),
        };
        let result = ProbeResult {
            label: target.label.clone(),
            url: target.url.clone(),
            reachable,
            expect: target.expect,
            detail,
        };

        let state = if result.reachable { "reachable" } else { "unreachable" };
        if result.passed() {
            info!(
                "ok   {} ({}): {state}, {}",
                result.label, result.url, result.detail
            );
        } else {
            warn!(
                "FAIL {} ({}): {state}, expected {}, {}",
                result.label, result.url, result.expect, result.detail
            );
        }
        result
    }

    /// Probes every target in order and logs the summary line.
    pub async fn run(&self, targets: &[ProbeTarget]) -> VerifyResult {
        let mut result = VerifyResult::default();
        for target in targets {
            result.probes.push(self.probe(target).await);
        }
        if result.success() {
            info!("{}", result.summary());
        } else {
            warn!("{}", result.summary());
        }
        result
    }

    /// Like [`Verifier::run`], but gives up as soon as `shutdown` resolves.
    ///
    /// Returns `None` when interrupted; results gathered so far are dropped.
    pub async fn run_until<S>(&self, targets: &[ProbeTarget], shutdown: S) -> Option<VerifyResult>
    where
        S: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = shutdown => {
                warn!("Verification interrupted");
                None
            }
            result = self.run(targets) => Some(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(reachable: bool, expect: Expectation) -> ProbeResult {
        ProbeResult {
            label: "probe".to_string(),
            url: "https://example.invalid".to_string(),
            reachable,
            expect,
            detail: String::new(),
        }
    }

    #[test]
    fn test_passed_respects_expectation() {
        assert!(result(true, Expectation::Reachable).passed());
        assert!(!result(false, Expectation::Reachable).passed());
        assert!(result(false, Expectation::Blocked).passed());
        assert!(!result(true, Expectation::Blocked).passed());
    }

    #[test]
    fn test_summary_line() {
        let all_good = VerifyResult {
            probes: vec![
                result(true, Expectation::Reachable),
                result(false, Expectation::Blocked),
            ],
        };
        assert!(all_good.success());
        assert_eq!(all_good.summary(), "Verification summary: PASS (2/2 probes)");

        let one_bad = VerifyResult {
            probes: vec![
                result(true, Expectation::Reachable),
                result(true, Expectation::Blocked),
            ],
        };
        assert!(!one_bad.success());
        assert_eq!(one_bad.failed(), 1);
        assert_eq!(one_bad.summary(), "Verification summary: FAIL (1/2 probes)");
    }

    #[test]
    fn test_empty_run_passes() {
        assert!(VerifyResult::default().success());
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let verifier = Verifier::new(Duration::from_millis(500), Duration::from_secs(2)).unwrap();
        let targets = [
            ProbeTarget::new("closed port", "http://127.0.0.1:9"),
            ProbeTarget {
                label: "closed canary".to_string(),
                url: "http://127.0.0.1:9".to_string(),
                expect: Expectation::Blocked,
            },
        ];
        let result = verifier.run(&targets).await;

        assert!(!result.probes[0].reachable);
        assert!(!result.probes[0].passed());
        assert!(result.probes[1].passed());
        assert_eq!(result.failed(), 1);
    }

    #[test]
    fn test_default_expectation_deserializes() {
        let target: ProbeTarget =
            serde_json::from_str(r#"{"label":"x","url":"https://x.example"}"#).unwrap();
        assert_eq!(target.expect, Expectation::Reachable);
    }

    #[tokio::test]
    async fn test_shutdown_stops_verification() {
        let verifier = Verifier::new(Duration::from_millis(500), Duration::from_secs(2)).unwrap();
        let targets = [ProbeTarget::new("closed port", "http://127.0.0.1:9")];

        assert_eq!(verifier.run_until(&targets, async {}).await, None);

        let finished = verifier
            .run_until(&targets, std::future::pending())
            .await
            .unwrap();
        assert_eq!(finished.probes.len(), 1);
    }
}
