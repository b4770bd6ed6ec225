//! Privilege elevation for packet-filter operations
//!
//! Only `nft` is elevated. The initializer normally runs as root inside the
//! container; otherwise it falls back to non-interactive `sudo -n`, which
//! fails fast instead of prompting.
//!
//! # Environment Variables
//!
//! - `DCFW_NFT_COMMAND`: replace `nft` with another command line, split on
//!   whitespace (e.g. `sh /path/to/mock_nft.sh`). Used by the test suite.
//! - `DCFW_IP_COMMAND`: same for the `ip` binary used by audit captures.
//! - `DCFW_TEST_NO_ELEVATION`: run the command directly, never via `sudo`.
//!
//! # Example
//!
//! ```no_run
//! use dcfw::elevation::create_nft_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_nft_command(&["-j", "list", "ruleset", "ip"])?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Not root and `sudo` is missing
    #[error("dcfw must run as root (or with sudo available) to manage nftables")]
    NotPrivileged,

    /// The override variable is set but empty
    #[error("{0} is set but empty")]
    EmptyOverride(&'static str),
}

/// Checks if a binary exists in PATH
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Builds `program args...`, honouring an override variable.
fn base_command(
    program: &str,
    override_var: &'static str,
    args: &[&str],
) -> Result<(Command, bool), ElevationError> {
    if let Ok(line) = std::env::var(override_var) {
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            return Err(ElevationError::EmptyOverride(override_var));
        };
        let mut cmd = Command::new(head);
        cmd.args(parts).args(args);
        return Ok((cmd, true));
    }
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok((cmd, false))
}

/// Whether this process may run `nft` without elevation
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Fails early when nft can be run neither directly nor through sudo.
///
/// # Errors
///
/// Returns `ElevationError::NotPrivileged` if not root and `sudo` is missing.
pub fn check_privileges() -> Result<(), ElevationError> {
    if std::env::var_os("DCFW_TEST_NO_ELEVATION").is_some()
        || std::env::var_os("DCFW_NFT_COMMAND").is_some()
        || is_root()
        || binary_exists("sudo")
    {
        Ok(())
    } else {
        Err(ElevationError::NotPrivileged)
    }
}

/// Creates an `nft` command with the specified arguments
///
/// Arguments are passed directly without shell interpretation.
///
/// # Elevation Strategy
///
/// 1. `DCFW_NFT_COMMAND` override or `DCFW_TEST_NO_ELEVATION`: run as is
/// 2. Root: run `nft` directly
/// 3. Otherwise: `sudo -n nft ...`
///
/// # Errors
///
/// Returns `ElevationError::NotPrivileged` if not root and `sudo` is missing.
pub fn create_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    let (cmd, overridden) = base_command("nft", "DCFW_NFT_COMMAND", args)?;
    if overridden || std::env::var_os("DCFW_TEST_NO_ELEVATION").is_some() || is_root() {
        return Ok(cmd);
    }

    if !binary_exists("sudo") {
        return Err(ElevationError::NotPrivileged);
    }
    let mut sudo = Command::new("sudo");
    sudo.arg("-n").arg("nft").args(args);
    Ok(sudo)
}

/// Creates an `ip` command. Route listings need no privileges.
pub fn create_ip_command(args: &[&str]) -> Command {
    match base_command("ip", "DCFW_IP_COMMAND", args) {
        Ok((cmd, _)) => cmd,
        Err(_) => {
            let mut cmd = Command::new("ip");
            cmd.args(args);
            cmd
        }
    }
}
