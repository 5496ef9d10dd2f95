//! Artifact checksum manifest: relative path -> expected MD5 hex digest.
//!
//! The coordinator publishes one manifest per artifact root in Java
//! properties format (`path=md5hex` lines). Lookups normalize separators so
//! zip entry paths match regardless of platform.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, String>,
}

impl ChecksumManifest {
    /// Parses properties-format text: `key=value` per line, `#` comments and
    /// blank lines ignored. Later duplicates win.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(normalize(key.trim()), value.trim().to_string());
            }
        }
        ChecksumManifest { entries }
    }

    pub fn md5_for(&self, path: &str) -> Option<&str> {
        self.entries.get(&normalize(path)).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Hex MD5 digest of a byte slice; streaming callers feed a [`Md5`] directly.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties_lines_and_skips_noise() {
        let manifest = ChecksumManifest::parse(
            "# generated\n\nlog/a=524ebd45bd7de3616317127f6e639bd6\nlog/b=83c0aa3048df233340203c74e8a93d7d\n",
        );
        assert_eq!(
            manifest.md5_for("log/a"),
            Some("524ebd45bd7de3616317127f6e639bd6")
        );
        assert_eq!(manifest.md5_for("log/c"), None);
    }

    #[test]
    fn lookup_normalizes_backslashes() {
        let manifest = ChecksumManifest::parse("dir/file=abc123\n");
        assert_eq!(manifest.md5_for("dir\\file"), Some("abc123"));
    }

    #[test]
    fn md5_matches_known_vector() {
        assert_eq!(md5_hex(b"some content"), "9893532233caff98cd083a116b013c0b");
    }
}
