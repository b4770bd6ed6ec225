//! Audit recorder: before/after state capture around an install
//!
//! A run directory `dcfw-audit-<timestamp>-<id>` under the audit root holds:
//!
//! - `config.json`: the effective configuration
//! - `before/`, `after/`: one file per captured [`Artifact`]
//! - `diff/`: a unified diff per artifact
//! - `manifest.json`: SHA-256 of every captured file plus the run outcome
//! - `events.jsonl`: one [`AuditEvent`] per line
//!
//! The "before" snapshot is on disk before the bracketed work starts.
//! [`AuditRecorder::bracket`] runs the "after" capture and writes the diff on
//! every exit path of the bracketed work: success, error, or shutdown signal.
//! If the run directory cannot be created the work still runs; snapshots and
//! diffs are then kept in memory and only the report is printed.

use crate::config::Config;
use crate::core::error::{Error, Result};
use crate::core::state::{Artifact, FirewallState};
use crate::utils::{
    append_private_line, create_private_dir, run_dir_name, sha256_hex, write_private_file,
};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::future::Future;
use std::path::PathBuf;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

/// Capture point
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[strum(serialize = "before")]
    Before,
    #[strum(serialize = "after")]
    After,
}

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    SnapshotCaptured,
    InstallSucceeded,
    InstallFailed,
    Interrupted,
    DiffWritten,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Every artifact one capture point could obtain
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub artifacts: BTreeMap<Artifact, String>,
}

impl Snapshot {
    /// Captures every artifact. A failed capture is logged and left out.
    pub async fn capture(state: &dyn FirewallState, phase: Phase) -> Self {
        let mut artifacts = BTreeMap::new();
        for artifact in Artifact::iter() {
            match state.capture(artifact).await {
                Some(text) => {
                    artifacts.insert(artifact, text);
                }
                None => warn!("{phase}: {} unavailable, skipped", artifact.title()),
            }
        }
        debug!("{phase} snapshot: {} artifacts", artifacts.len());
        Self {
            phase,
            captured_at: chrono::Utc::now(),
            artifacts,
        }
    }

    pub fn get(&self, artifact: Artifact) -> Option<&str> {
        self.artifacts.get(&artifact).map(String::as_str)
    }
}

/// Line diff of one artifact between the two capture points
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDiff {
    pub artifact: Artifact,
    pub added: usize,
    pub removed: usize,
    /// Unified diff; empty when unchanged
    #[serde(skip)]
    pub unified: String,
    /// Whether either capture point is missing this artifact
    pub partial: bool,
}

impl ArtifactDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Diffs two captures of `artifact`. A missing capture diffs as empty text.
pub fn diff_artifact(artifact: Artifact, before: Option<&str>, after: Option<&str>) -> ArtifactDiff {
    let old = before.unwrap_or_default();
    let new = after.unwrap_or_default();
    let diff = TextDiff::from_lines(old, new);

    let (mut added, mut removed) = (0, 0);
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }

    let unified = if added + removed == 0 {
        String::new()
    } else {
        let name = artifact.file_name();
        diff.unified_diff()
            .context_radius(3)
            .header(&format!("before/{name}"), &format!("after/{name}"))
            .to_string()
    };

    ArtifactDiff {
        artifact,
        added,
        removed,
        unified,
        partial: before.is_none() || after.is_none(),
    }
}

#[derive(Debug, Serialize)]
struct ManifestEntry {
    phase: Phase,
    file: String,
    bytes: usize,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    run_id: uuid::Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
    success: bool,
    error: Option<String>,
    artifacts: Vec<ManifestEntry>,
    diffs: &'a [ArtifactDiff],
}

/// Outcome of one bracketed run
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub dir: PathBuf,
    /// Whether `dir` holds the snapshots; false if it could not be created
    pub persisted: bool,
    pub success: bool,
    pub diffs: Vec<ArtifactDiff>,
}

impl AuditReport {
    pub fn diff(&self, artifact: Artifact) -> Option<&ArtifactDiff> {
        self.diffs.iter().find(|d| d.artifact == artifact)
    }

    /// Whether any artifact changed between the capture points
    pub fn has_changes(&self) -> bool {
        self.diffs.iter().any(|d| !d.is_empty())
    }

    /// Diff report for the rule chains and address sets
    pub fn render(&self) -> String {
        let mut out = String::new();
        for diff in self.diffs.iter().filter(|d| d.artifact.reported()) {
            let _ = writeln!(
                out,
                "=== {} (+{} -{}) ===",
                diff.artifact.title(),
                diff.added,
                diff.removed
            );
            if diff.is_empty() {
                out.push_str(if diff.partial {
                    "(not captured)\n"
                } else {
                    "(no changes)\n"
                });
            } else {
                out.push_str(&diff.unified);
                if !diff.unified.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        if self.persisted {
            let _ = writeln!(out, "Full snapshots: {}", self.dir.display());
        } else {
            let _ = writeln!(
                out,
                "Full snapshots: not written ({} could not be created)",
                self.dir.display()
            );
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

/// Result of [`AuditRecorder::bracket`]: the work's outcome plus the audit
pub struct Bracketed<T> {
    pub outcome: Result<T>,
    pub report: AuditReport,
}

/// Writes run directories under an audit root
pub struct AuditRecorder {
    root: PathBuf,
    config: serde_json::Value,
}

impl AuditRecorder {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            config: serde_json::to_value(config).unwrap_or_default(),
        }
    }

    /// Creates the run directory, then captures and writes "before".
    ///
    /// Never fails: a run directory that cannot be created is logged and the
    /// session continues in memory.
    pub async fn begin(&self, state: &dyn FirewallState) -> AuditSession {
        let run_id = uuid::Uuid::new_v4();
        let started = chrono::Local::now();
        let dir = self.root.join(run_dir_name(started, run_id));
        let persisted = match create_private_dir(&dir) {
            Ok(_) => {
                info!("Audit directory: {}", dir.display());
                true
            }
            Err(e) => {
                warn!(
                    "Cannot create audit directory {}: {e}; snapshots stay in memory",
                    dir.display()
                );
                false
            }
        };

        let before = Snapshot::capture(state, Phase::Before).await;
        let mut session = AuditSession {
            dir,
            persisted,
            run_id,
            started_at: started.with_timezone(&chrono::Utc),
            before: before.clone(),
            files: Vec::new(),
        };

        session
            .log(AuditEvent::new(
                EventType::RunStarted,
                true,
                serde_json::json!({ "run_id": run_id }),
                None,
            ))
            .await;
        session.write_config(&self.config).await;
        session.write_snapshot(&before).await;
        session
    }

    /// Captures "before", runs `work` until it completes or `shutdown`
    /// resolves, then always captures "after" and writes the diff.
    ///
    /// The work's own failure is in [`Bracketed::outcome`].
    pub async fn bracket<T, W, S>(
        &self,
        state: &dyn FirewallState,
        work: W,
        shutdown: S,
    ) -> Bracketed<T>
    where
        W: Future<Output = Result<T>>,
        S: Future<Output = ()>,
    {
        let session = self.begin(state).await;

        let outcome = tokio::select! {
            result = work => result,
            () = shutdown => {
                warn!("Shutdown signal received, abandoning install");
                Err(Error::Interrupted)
            }
        };

        let report = session.finish(state, outcome.as_ref().err()).await;
        Bracketed { outcome, report }
    }
}

/// An open run directory with its "before" snapshot
pub struct AuditSession {
    dir: PathBuf,
    persisted: bool,
    run_id: uuid::Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    before: Snapshot,
    files: Vec<ManifestEntry>,
}

impl AuditSession {
    /// Captures "after", writes it with the diffs and manifest.
    ///
    /// Never fails: write errors are logged and the report is still returned.
    pub async fn finish(mut self, state: &dyn FirewallState, error: Option<&Error>) -> AuditReport {
        let after = Snapshot::capture(state, Phase::After).await;
        let success = error.is_none();

        let event_type = match error {
            None => EventType::InstallSucceeded,
            Some(Error::Interrupted) => EventType::Interrupted,
            Some(_) => EventType::InstallFailed,
        };
        self.log(AuditEvent::new(
            event_type,
            success,
            serde_json::json!({}),
            error.map(ToString::to_string),
        ))
        .await;

        self.write_snapshot(&after).await;

        let diffs: Vec<ArtifactDiff> = Artifact::iter()
            .map(|artifact| {
                diff_artifact(artifact, self.before.get(artifact), after.get(artifact))
            })
            .collect();
        self.write_diffs(&diffs).await;
        self.write_manifest(success, error, &diffs).await;

        let changed = diffs.iter().filter(|d| !d.is_empty()).count();
        self.log(AuditEvent::new(
            EventType::DiffWritten,
            true,
            serde_json::json!({ "changed_artifacts": changed }),
            None,
        ))
        .await;

        AuditReport {
            dir: self.dir,
            persisted: self.persisted,
            success,
            diffs,
        }
    }

    async fn write_config(&self, config: &serde_json::Value) {
        if !self.persisted {
            return;
        }
        let path = self.dir.join("config.json");
        let written = match serde_json::to_vec_pretty(config) {
            Ok(bytes) => write_private_file(&path, &bytes).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = written {
            warn!("Cannot write {}: {e}", path.display());
        }
    }

    async fn write_snapshot(&mut self, snapshot: &Snapshot) {
        if !self.persisted {
            return;
        }
        let phase_dir = self.dir.join(snapshot.phase.to_string());
        if let Err(e) = create_private_dir(&phase_dir) {
            warn!("Cannot create {}: {e}", phase_dir.display());
            return;
        }
        for (artifact, text) in &snapshot.artifacts {
            let file = format!("{}/{}", snapshot.phase, artifact.file_name());
            match write_private_file(&self.dir.join(&file), text.as_bytes()).await {
                Ok(()) => self.files.push(ManifestEntry {
                    phase: snapshot.phase,
                    file,
                    bytes: text.len(),
                    sha256: sha256_hex(text.as_bytes()),
                }),
                Err(e) => warn!("Cannot write {file}: {e}"),
            }
        }
        self.log(AuditEvent::new(
            EventType::SnapshotCaptured,
            true,
            serde_json::json!({
                "phase": snapshot.phase,
                "artifacts": snapshot.artifacts.len(),
            }),
            None,
        ))
        .await;
    }

    async fn write_diffs(&self, diffs: &[ArtifactDiff]) {
        if !self.persisted {
            return;
        }
        let diff_dir = self.dir.join("diff");
        if let Err(e) = create_private_dir(&diff_dir) {
            warn!("Cannot create {}: {e}", diff_dir.display());
            return;
        }
        for diff in diffs.iter().filter(|d| !d.is_empty()) {
            let path = diff_dir.join(format!("{}.diff", diff.artifact.file_name()));
            if let Err(e) = write_private_file(&path, diff.unified.as_bytes()).await {
                warn!("Cannot write {}: {e}", path.display());
            }
        }
    }

    async fn write_manifest(&mut self, success: bool, error: Option<&Error>, diffs: &[ArtifactDiff]) {
        if !self.persisted {
            return;
        }
        let manifest = Manifest {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: chrono::Utc::now(),
            success,
            error: error.map(ToString::to_string),
            artifacts: std::mem::take(&mut self.files),
            diffs,
        };
        let path = self.dir.join("manifest.json");
        let written = match serde_json::to_vec_pretty(&manifest) {
            Ok(bytes) => write_private_file(&path, &bytes).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = written {
            warn!("Cannot write {}: {e}", path.display());
        }
    }

    async fn log(&self, event: AuditEvent) {
        if !self.persisted {
            return;
        }
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize audit event: {e}");
                return;
            }
        };
        if let Err(e) = append_private_line(&self.dir.join("events.jsonl"), &line).await {
            warn!("Failed to write audit log: {e}");
        }
    }
}
