//! Error redaction for messages that travel back to the oracle or into
//! shared log sinks.
//!
//! Strips connection details, file paths, and credential-shaped strings from
//! error text while preserving actionable information like collection names
//! and validation messages. Raw snippet text and tenant record contents never
//! pass through here at all; callers log hashes and previews instead.

use std::sync::LazyLock;

use regex::Regex;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s'")\]}>]+"#).expect("static regex is valid")
});

static IP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").expect("static regex is valid")
});

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot)(/[\w.\-]+)+")
        .expect("static regex is valid")
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api[_-]?key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .expect("static regex is valid")
});

/// Redact sensitive patterns from an error message.
///
/// - URLs → `[url]`
/// - IP:port addresses → `[addr]`
/// - Unix file paths → `[path]`
/// - Credential-shaped strings → `[REDACTED]`
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();
    // Credentials first; they may embed URLs.
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = URL_RE.replace_all(&msg, "[url]").to_string();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_urls_and_addresses() {
        let msg = "connect to https://internal.corp:9876/secret failed via 10.0.0.1:5432";
        let redacted = redact_error_message(msg);
        assert!(!redacted.contains("internal.corp"));
        assert!(!redacted.contains("10.0.0.1"));
        assert!(redacted.contains("[url]"));
        assert!(redacted.contains("[addr]"));
    }

    #[test]
    fn strips_paths() {
        let msg = "open /var/lib/adlib/tenants/abc/members.json failed";
        let redacted = redact_error_message(msg);
        assert!(!redacted.contains("/var/lib"));
        assert!(redacted.contains("[path]"));
    }

    #[test]
    fn strips_credentials() {
        let msg = "request had Authorization: Bearer sk-abc123 and api_key=xyz";
        let redacted = redact_error_message(msg);
        assert!(!redacted.contains("sk-abc123"));
        assert!(!redacted.contains("xyz"));
    }

    #[test]
    fn keeps_actionable_text() {
        let msg = "record with identifier 7 already exists";
        assert_eq!(redact_error_message(msg), msg);
    }
}
