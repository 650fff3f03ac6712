//! File manifest of a source bundle
//!
//! The content hash is computed from the manifest rather than from the
//! archive bytes, so it only depends on which files are shipped and what
//! they contain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single file in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Root-relative path with `/` separators
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// SHA-256 of the file contents (hex)
    pub sha256: String,

    /// Whether the file keeps its executable bit in the archive
    #[serde(default)]
    pub executable: bool,
}

/// Sorted list of bundled files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    pub entries: Vec<ManifestEntry>,
}

impl SourceManifest {
    /// Build a manifest, sorting entries by path
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self { entries }
    }

    /// Digest over `(path, file digest)` pairs in path order
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update(entry.sha256.as_bytes());
            hasher.update(b"  ");
            hasher.update(entry.path.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Sum of file sizes
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, sha: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            size: 1,
            sha256: sha.to_string(),
            executable: false,
        }
    }

    #[test]
    fn test_hash_independent_of_insertion_order() {
        let a = SourceManifest::new(vec![entry("b.py", "22"), entry("a.py", "11")]);
        let b = SourceManifest::new(vec![entry("a.py", "11"), entry("b.py", "22")]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_hash_changes_with_content_or_path() {
        let base = SourceManifest::new(vec![entry("a.py", "11")]);
        let renamed = SourceManifest::new(vec![entry("b.py", "11")]);
        let edited = SourceManifest::new(vec![entry("a.py", "12")]);
        assert_ne!(base.content_hash(), renamed.content_hash());
        assert_ne!(base.content_hash(), edited.content_hash());
    }
}
