//! Input validation and sanitization functions for DCFW
//!
//! Domain names and nft object names end up in privileged `nft` invocations,
//! so they are checked before any mutation happens.

/// Sanitizes text for safe use in nftables comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use dcfw::validators::sanitize_comment;
///
/// let safe = sanitize_comment("allow dns 10.0.0.53");
/// assert_eq!(safe, "allow dns 10.0.0.53");
///
/// let safe = sanitize_comment("Test\nNewline\"Quote");
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: Use ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '/')
        })
        .take(64)
        .collect()
}

/// Validates a domain name from the allowlist.
///
/// Returns the lowercased name with any trailing root dot removed.
///
/// # Errors
///
/// Returns `Err` if:
/// - The name is empty or longer than 253 characters
/// - It has fewer than two labels
/// - A label is empty, longer than 63 characters, or starts/ends with `-`
/// - A label contains anything other than ASCII letters, digits, or `-`
pub fn validate_domain(input: &str) -> Result<String, String> {
    let name = input.trim().trim_end_matches('.').to_ascii_lowercase();

    if name.is_empty() {
        return Err("Domain name cannot be empty".to_string());
    }
    if name.len() > 253 {
        return Err("Domain name too long (max 253 characters)".to_string());
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(format!("'{name}' is not a fully qualified domain name"));
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("'{name}' has an empty or oversized label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("'{name}' has a label starting or ending with '-'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("'{name}' contains invalid characters"));
        }
    }

    Ok(name)
}

/// Validates an nftables table, chain, or set name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 31 characters, does not
/// start with a letter, or contains characters other than `[A-Za-z0-9_]`.
pub fn validate_object_name(input: &str) -> Result<&str, String> {
    if input.is_empty() || input.len() > 31 {
        return Err(format!("'{input}' must be 1-31 characters"));
    }
    if !input.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(format!("'{input}' must start with a letter"));
    }
    if !input.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("'{input}' may only contain letters, digits, and '_'"));
    }
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_domain_normalizes() {
        assert_eq!(
            validate_domain("Registry.NPMJS.org.").unwrap(),
            "registry.npmjs.org"
        );
    }

    #[test]
    fn test_validate_domain_rejects_bad_names() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("bad..example.com").is_err());
        assert!(validate_domain("-lead.example.com").is_err());
        assert!(validate_domain("semi;colon.example.com").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("egress_allow").is_ok());
        assert!(validate_object_name("allowed_hosts_v4").is_ok());
        assert!(validate_object_name("1abc").is_err());
        assert!(validate_object_name("has-dash").is_err());
        assert!(validate_object_name(&"a".repeat(32)).is_err());
    }

    #[test]
    fn test_sanitize_comment_keeps_cidr() {
        assert_eq!(sanitize_comment("host subnet 10.0.5.0/24"), "host subnet 10.0.5.0/24");
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_sanitize_comment_never_exceeds_64_chars(input in "\\PC*") {
            let sanitized = sanitize_comment(&input);
            prop_assert!(sanitized.len() <= 64);
        }

        #[test]
        fn test_sanitize_comment_no_dangerous_chars(input in "\\PC*") {
            let sanitized = sanitize_comment(&input);
            prop_assert!(!sanitized.contains('"'));
            prop_assert!(!sanitized.contains('\''));
            prop_assert!(!sanitized.contains('$'));
            prop_assert!(!sanitized.contains(';'));
            prop_assert!(!sanitized.chars().any(char::is_control));
        }

        #[test]
        fn test_valid_domains_accepted(
            host in "[a-z][a-z0-9]{0,20}",
            tld in "[a-z]{2,6}"
        ) {
            let name = format!("{host}.{tld}");
            prop_assert_eq!(validate_domain(&name).unwrap(), name);
        }

        #[test]
        fn test_domains_with_invalid_chars_rejected(
            prefix in "[a-z]{1,10}",
            invalid_char in "[^a-zA-Z0-9.-]"
        ) {
            let name = format!("{prefix}{invalid_char}.com");
            prop_assert!(validate_domain(&name).is_err());
        }
    }
}
