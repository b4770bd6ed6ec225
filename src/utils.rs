//! Filesystem helpers for the audit directory
//!
//! Audit artifacts contain the host's full ruleset, so directories are created
//! `0o700` and files `0o600`.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Prefix of every per-run audit directory
pub const RUN_DIR_PREFIX: &str = "dcfw-audit";

/// `dcfw-audit-YYYYmmdd-HHMMSS-<first 8 hex of run id>`
pub fn run_dir_name(started: chrono::DateTime<chrono::Local>, run_id: uuid::Uuid) -> String {
    let id = run_id.simple().to_string();
    format!(
        "{RUN_DIR_PREFIX}-{}-{}",
        started.format("%Y%m%d-%H%M%S"),
        &id[..8]
    )
}

pub fn create_private_dir(path: &Path) -> std::io::Result<PathBuf> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(path)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)?;
    }

    Ok(path.to_path_buf())
}

/// Writes `contents` to a new owner-only file, replacing any previous one.
pub async fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

/// Appends one line to an owner-only file, creating it if needed.
pub async fn append_private_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await?;
    Ok(())
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
