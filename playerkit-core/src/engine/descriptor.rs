//! Media descriptors and configuration fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Source an engine is configured with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Source URI or path
    pub uri: String,

    /// Backend hints (container, codec, hardware decode, ...)
    ///
    /// Sorted so the fingerprint does not depend on insertion order.
    #[serde(default)]
    pub format_hints: BTreeMap<String, String>,
}

impl MediaDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            format_hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.format_hints.insert(key.into(), value.into());
        self
    }

    /// Fingerprint of the decoder/renderer configuration this source needs
    ///
    /// Derived from the format hints only: two sources with the same hints
    /// can share a warm engine.
    pub fn fingerprint(&self) -> ConfigFingerprint {
        let mut hasher = Sha256::new();
        for (key, value) in &self.format_hints {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        ConfigFingerprint(format!("{:x}", hasher.finalize()))
    }
}

/// Pool reuse key: engines configured alike share a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// Fingerprint from an explicit reuse key (e.g. "feed", "detail")
    pub fn from_key(key: &str) -> Self {
        ConfigFingerprint(format!("{:x}", Sha256::digest(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_uri_and_hint_order() {
        let a = MediaDescriptor::new("clip.mp4")
            .with_hint("codec", "h264")
            .with_hint("container", "mp4");
        let b = MediaDescriptor::new("other.mp4")
            .with_hint("container", "mp4")
            .with_hint("codec", "h264");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_by_hints() {
        let h264 = MediaDescriptor::new("a").with_hint("codec", "h264");
        let hevc = MediaDescriptor::new("a").with_hint("codec", "hevc");
        assert_ne!(h264.fingerprint(), hevc.fingerprint());
    }

    #[test]
    fn test_key_fingerprint_is_stable() {
        assert_eq!(ConfigFingerprint::from_key("feed"), ConfigFingerprint::from_key("feed"));
        assert_ne!(ConfigFingerprint::from_key("feed"), ConfigFingerprint::from_key("detail"));
        assert_eq!(ConfigFingerprint::from_key("feed").short().len(), 12);
    }

    #[test]
    fn test_fingerprint_is_lowercase_sha256_hex() {
        let empty = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(ConfigFingerprint::from_key("").as_str(), empty);
        assert_eq!(MediaDescriptor::new("clip.mp4").fingerprint().as_str(), empty);
    }
}
