use crate::core::firewall::Family;
use thiserror::Error;

/// Core error types for DCFW
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// HTTP request failed (range feed)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Configuration or input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The packet filter for a required address family is missing
    #[error("{} packet filtering is not available on this host", .0.label())]
    FamilyUnavailable(Family),

    /// A termination signal arrived before installation completed
    #[error("Interrupted by signal before installation completed")]
    Interrupted,

    /// Injected failure or internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the user-facing translation for errors that have one.
    pub fn translate(&self) -> Option<ErrorTranslation> {
        match self {
            Self::Nftables { message, .. } => Some(NftablesErrorPattern::match_error(message)),
            Self::Elevation(e) => Some(
                ErrorTranslation::new(e.to_string())
                    .with_suggestion("Run dcfw as root inside the container")
                    .with_suggestion("Or grant passwordless sudo for nft to the invoking user"),
            ),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of nftables error patterns and their translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Containers started without NET_ADMIN land here
        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Start the container with --cap-add=NET_ADMIN")
                .with_suggestion("Run dcfw as root (or via passwordless sudo)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Quick_reference-nftables_in_10_minutes");
        }

        if lower.contains("cache initialization failed") {
            return ErrorTranslation::new(
                "Failed to initialize nftables cache - insufficient privileges",
            )
            .with_suggestion("The container is probably missing the NET_ADMIN capability")
            .with_suggestion("Check the supervisor's privilege settings for this initializer");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("nftables is not installed or not found in PATH")
                .with_suggestion("Install nftables in the container image: apt-get install nftables")
                .with_suggestion("Or: apk add nftables  (Alpine)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Main_Page");
        }

        if lower.contains("could not process rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("nftables rejected a generated rule")
                .with_suggestion("Check the resolved addresses and range feed entries in the log")
                .with_suggestion("Inspect the raw listings in the audit directory");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall table does not exist")
                .with_suggestion("Another process may have deleted the dcfw table mid-run")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_tables");
        }

        if lower.contains("chain")
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Another process may have deleted the egress chain mid-run")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Configuring_chains");
        }

        if lower.contains("resource busy") || lower.contains("device or resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another firewall initializer may be running concurrently")
                .with_suggestion("Serialize dcfw invocations at the supervisor level");
        }

        if lower.contains("netlink") || lower.contains("protocol not supported") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("The host kernel may lack nf_tables support")
                .with_suggestion("Check kernel modules on the host: lsmod | grep nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Compare the before/after listings in the audit directory")
            .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nftables_missing_command() {
        let translation = NftablesErrorPattern::match_error("command not found: nft");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 2);
    }

    #[test]
    fn test_permission_error_mentions_capability() {
        let translation = NftablesErrorPattern::match_error("Error: Operation not permitted");
        assert!(translation.user_message.contains("permissions"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("NET_ADMIN"))
        );
        assert!(translation.help_url.is_some());
    }

    #[test]
    fn test_busy_suggests_serialization() {
        let translation = NftablesErrorPattern::match_error("Device or resource busy");
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("Serialize"))
        );
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = NftablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_translate_only_for_firewall_errors() {
        let nft = Error::Nftables {
            message: "netlink error".to_string(),
            stderr: None,
            exit_code: Some(1),
        };
        assert!(nft.translate().is_some());
        assert!(Error::Interrupted.translate().is_none());
    }

    #[test]
    fn test_family_unavailable_message() {
        let err = Error::FamilyUnavailable(Family::V6);
        assert!(err.to_string().contains("IPv6"));
    }
}
