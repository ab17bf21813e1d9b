//! Content-addressed configuration tokens.
//!
//! The dispatch response identifies a host's serialized configuration by a
//! CRC-64 checksum folded over every piece that affects routing, encoded
//! as base64. Alias hosts never get a checksum: their token is the literal
//! `"h-" + canonical_name`, so a front end that cached an alias answer can
//! revalidate without the backend re-serializing anything.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use crc::{Crc, Digest, CRC_64_ECMA_182};

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Marker folded before each ignore pattern so an ignore pattern and a
/// match pattern with the same text hash differently.
const IGNORE_MARKER: &str = "i";

/// Incremental checksum over the serialized configuration.
pub struct EtagDigest {
    digest: Digest<'static, u64>,
}

impl EtagDigest {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn update(&mut self, value: &str) {
        self.digest.update(value.as_bytes());
    }

    pub fn update_ignore(&mut self, pattern: &str) {
        self.update(IGNORE_MARKER);
        self.update(pattern);
    }

    /// Base64 of the final checksum.
    pub fn finish(self) -> String {
        STANDARD_NO_PAD.encode(self.digest.finalize().to_be_bytes())
    }
}

impl Default for EtagDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// The alias-host token: `"h-" + canonical name`, never a checksum.
pub fn alias_etag(canonical: &str) -> String {
    format!("h-{canonical}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(parts: &[&str]) -> String {
        let mut d = EtagDigest::new();
        for p in parts {
            d.update(p);
        }
        d.finish()
    }

    #[test]
    fn test_deterministic() {
        let a = digest_of(&["1.0", "web-tier", "/app", "*.jsp"]);
        let b = digest_of(&["1.0", "web-tier", "/app", "*.jsp"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_input_change_changes_etag() {
        let base = digest_of(&["1.0", "web-tier", "/app", "*.jsp"]);
        assert_ne!(base, digest_of(&["1.1", "web-tier", "/app", "*.jsp"]));
        assert_ne!(base, digest_of(&["1.0", "app-tier", "/app", "*.jsp"]));
        assert_ne!(base, digest_of(&["1.0", "web-tier", "/other", "*.jsp"]));
        assert_ne!(base, digest_of(&["1.0", "web-tier", "/app", "*.php"]));
    }

    #[test]
    fn test_ignore_pattern_distinct_from_match_pattern() {
        let as_match = digest_of(&["*.gif"]);

        let mut d = EtagDigest::new();
        d.update_ignore("*.gif");
        let as_ignore = d.finish();

        assert_ne!(as_match, as_ignore);
    }

    #[test]
    fn test_alias_etag_literal() {
        assert_eq!(alias_etag("www.example.com"), "h-www.example.com");
    }

    #[test]
    fn test_finish_is_base64_of_64_bits() {
        let etag = digest_of(&["anything"]);
        // 8 bytes -> 11 base64 chars without padding.
        assert_eq!(etag.len(), 11);
        assert!(etag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/'));
    }
}
