//! Helpers that keep addresses out of logs and error payloads.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub const ADDRESS_PLACEHOLDER: &str = "<address>";

fn address_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").ok())
        .as_ref()
}

/// Replace every email address in `text` with a placeholder.
///
/// Downstream errors (SMTP replies, HTTP bodies) routinely echo addresses
/// back; run them through here before they reach a log line or an outcome.
pub fn scrub_addresses(text: &str) -> String {
    match address_pattern() {
        Some(re) => re.replace_all(text, ADDRESS_PLACEHOLDER).into_owned(),
        // Without the pattern nothing can be verified clean.
        None => "<details withheld>".to_string(),
    }
}

/// Stable, non-reversible key for a sender/recipient relationship.
pub fn relationship_key(sender: &str, real_user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.trim().to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(real_user.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_addresses() {
        let scrubbed = scrub_addresses("550 5.1.1 <jane.doe+x@mail.example.com>: user unknown");
        assert_eq!(scrubbed, "550 5.1.1 <<address>>: user unknown");
        assert!(!scrubbed.contains("example.com"));
    }

    #[test]
    fn test_scrub_leaves_plain_text() {
        assert_eq!(scrub_addresses("connection reset"), "connection reset");
    }

    #[test]
    fn test_relationship_key_is_stable_and_opaque() {
        let a = relationship_key("Ex@Example.org", "parent@example.com");
        let b = relationship_key(" ex@example.org", "PARENT@example.com");
        let c = relationship_key("other@example.org", "parent@example.com");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(!a.contains("example"));
    }
}
