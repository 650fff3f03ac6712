//! Source bundling and content-addressed upload
//!
//! Walks the agent's source tree, applies ignore rules, hashes every
//! shipped file and produces a deterministic zip archive: entries sorted
//! by path, fixed timestamps, normalized permissions. Identical trees
//! always produce the same content hash and therefore the same storage
//! key, which lets [`SourceBundle::upload`] skip re-uploading.

mod exclude;
mod manifest;

pub use exclude::{ExcludeError, ExcludeRules, DEFAULT_IGNORE_FILE};
pub use manifest::{ManifestEntry, SourceManifest};

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::cloud::{CloudOp, CloudResult, ObjectStore, RetryPolicy};

/// Errors for bundling operations
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("source root {path} is not a readable directory: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("symlink escapes source root: {path}")]
    SymlinkEscapesRoot { path: PathBuf },

    #[error("ignore rules error: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("bundle size {actual_bytes} exceeds limit {limit_bytes}")]
    SizeExceeded {
        /// The bundle size in bytes
        actual_bytes: u64,
        /// The configured ceiling in bytes
        limit_bytes: u64,
    },

    #[error("required file {path} is missing from the bundle")]
    MissingEntry { path: String },
}

/// Source bundler producing deterministic archives
pub struct Bundler {
    /// Root directory to bundle
    root: PathBuf,
    /// Ignore rules
    exclude: ExcludeRules,
    /// Size ceiling in bytes (None = unlimited)
    max_bytes: Option<u64>,
}

impl Bundler {
    /// Create a bundler for `root` with the built-in ignore rules
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BundleError> {
        Ok(Self {
            root: root.into(),
            exclude: ExcludeRules::new()?,
            max_bytes: None,
        })
    }

    /// Set the size ceiling; 0 means no limit
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = if max_bytes > 0 { Some(max_bytes) } else { None };
        self
    }

    /// Load an ignore file if it exists
    pub fn with_ignore_file(mut self, path: &Path) -> Result<Self, BundleError> {
        if path.exists() {
            self.exclude = self.exclude.with_ignore_file(path)?;
        }
        Ok(self)
    }

    /// Add ignore patterns
    pub fn with_excludes(mut self, patterns: &[&str]) -> Result<Self, BundleError> {
        self.exclude = self.exclude.with_patterns(patterns)?;
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collect the files to ship, keyed by root-relative path
    fn collect_files(&self) -> Result<Vec<(String, PathBuf)>, BundleError> {
        let root = self
            .root
            .canonicalize()
            .and_then(|p| {
                if p.is_dir() {
                    Ok(p)
                } else {
                    Err(io::Error::new(io::ErrorKind::NotADirectory, "not a directory"))
                }
            })
            .map_err(|source| BundleError::UnreadableRoot {
                path: self.root.clone(),
                source,
            })?;

        let mut files = Vec::new();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                rel.as_os_str().is_empty()
                    || !(entry.file_type().is_dir() && self.exclude.can_prune(rel))
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path();
            let rel_path = match path.strip_prefix(&root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };

            if entry.file_type().is_dir() || self.exclude.is_excluded(rel_path) {
                continue;
            }

            let source_path = if entry.file_type().is_symlink() {
                let resolved = fs::canonicalize(path)
                    .map_err(|_| BundleError::SymlinkEscapesRoot { path: path.to_path_buf() })?;
                if !resolved.starts_with(&root) {
                    return Err(BundleError::SymlinkEscapesRoot {
                        path: path.to_path_buf(),
                    });
                }
                if resolved.is_dir() {
                    debug!(path = %rel_path.display(), "skipping symlinked directory");
                    continue;
                }
                resolved
            } else {
                path.to_path_buf()
            };

            let rel = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((rel, source_path));
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// Hash and archive the source tree for `agent_name`
    pub fn create_bundle(&self, agent_name: &str) -> Result<SourceBundle, BundleError> {
        let files = self.collect_files()?;

        let mut entries = Vec::with_capacity(files.len());
        let mut raw_total: u64 = 0;
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut cursor);

            for (rel, full_path) in &files {
                let contents = fs::read(full_path)?;
                raw_total += contents.len() as u64;
                if let Some(limit) = self.max_bytes {
                    if raw_total > limit {
                        return Err(BundleError::SizeExceeded {
                            actual_bytes: raw_total,
                            limit_bytes: limit,
                        });
                    }
                }

                let executable = is_executable(full_path);
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .last_modified_time(zip::DateTime::default())
                    .unix_permissions(if executable { 0o755 } else { 0o644 });
                zip.start_file(rel.as_str(), options)?;
                zip.write_all(&contents)?;

                entries.push(ManifestEntry {
                    path: rel.clone(),
                    size: contents.len() as u64,
                    sha256: hex::encode(Sha256::digest(&contents)),
                    executable,
                });
            }

            zip.finish()?;
        }

        let archive = cursor.into_inner();
        let size_bytes = archive.len() as u64;
        if let Some(limit) = self.max_bytes {
            if size_bytes > limit {
                return Err(BundleError::SizeExceeded {
                    actual_bytes: size_bytes,
                    limit_bytes: limit,
                });
            }
        }

        let manifest = SourceManifest::new(entries);
        let content_hash = manifest.content_hash();
        let storage_key = storage_key(agent_name, &content_hash);

        info!(
            agent = agent_name,
            files = manifest.len(),
            size_bytes,
            content_hash = %content_hash,
            "source bundle created"
        );

        Ok(SourceBundle {
            content_hash,
            size_bytes,
            storage_key,
            archive,
            manifest,
        })
    }
}

/// Content-addressed key for a bundle
pub fn storage_key(agent_name: &str, content_hash: &str) -> String {
    format!("{}/source-{}.zip", agent_name, content_hash)
}

/// Outcome of an upload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded,
    /// An object with the same key already existed
    CacheHit,
}

/// A hashed, archived source tree
#[derive(Debug, Clone)]
pub struct SourceBundle {
    /// SHA-256 over the filtered file set
    pub content_hash: String,
    /// Archive size in bytes
    pub size_bytes: u64,
    /// Object key derived from the content hash
    pub storage_key: String,
    /// Zip archive bytes
    pub archive: Vec<u8>,
    /// Bundled files
    pub manifest: SourceManifest,
}

impl SourceBundle {
    /// Fail unless `path` was bundled
    pub fn require(&self, path: &str) -> Result<(), BundleError> {
        if self.manifest.contains(path) {
            Ok(())
        } else {
            Err(BundleError::MissingEntry {
                path: path.to_string(),
            })
        }
    }

    /// Image tag derived from the content hash
    pub fn image_tag(&self) -> String {
        format!("src-{}", &self.content_hash[..12.min(self.content_hash.len())])
    }

    /// Upload the archive unless an object with the same key exists
    pub fn upload(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        retry: &RetryPolicy,
    ) -> CloudResult<UploadOutcome> {
        let exists = retry.run(CloudOp::HeadObject, || {
            store.object_exists(bucket, &self.storage_key)
        })?;
        if exists {
            info!(bucket, key = %self.storage_key, "source bundle already uploaded");
            return Ok(UploadOutcome::CacheHit);
        }

        retry.run(CloudOp::PutObject, || {
            store.put_object(bucket, &self.storage_key, &self.archive)
        })?;
        info!(bucket, key = %self.storage_key, size_bytes = self.size_bytes, "source bundle uploaded");
        Ok(UploadOutcome::Uploaded)
    }
}

/// Check if a file is executable
fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_dir() -> TempDir {
        let dir = TempDir::new().unwrap();

        fs::write(dir.path().join("agent.py"), "print('hi')").unwrap();
        fs::write(dir.path().join("requirements.txt"), "boto3\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM python:3.12\n").unwrap();

        fs::create_dir(dir.path().join("tools")).unwrap();
        fs::write(dir.path().join("tools/search.py"), "def search(): ...").unwrap();

        dir
    }

    #[test]
    fn test_bundler_basic() {
        let dir = create_test_dir();
        let bundle = Bundler::new(dir.path()).unwrap().create_bundle("my_agent").unwrap();

        assert!(!bundle.archive.is_empty());
        assert_eq!(bundle.content_hash.len(), 64);
        assert_eq!(bundle.size_bytes, bundle.archive.len() as u64);
        assert_eq!(bundle.manifest.len(), 4);
        assert!(bundle.storage_key.starts_with("my_agent/source-"));
        assert!(bundle.storage_key.ends_with(".zip"));
    }

    #[test]
    fn test_bundler_excludes_git_and_caches() {
        let dir = create_test_dir();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), "git config").unwrap();
        fs::create_dir(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/agent.pyc"), "bytes").unwrap();

        let bundle = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        assert!(!bundle.manifest.entries.iter().any(|e| e.path.starts_with(".git")));
        assert!(!bundle.manifest.entries.iter().any(|e| e.path.contains("__pycache__")));
    }

    #[test]
    fn test_ignore_file_applied() {
        let dir = create_test_dir();
        fs::write(dir.path().join(".dockerignore"), "tools/\n*.txt\n").unwrap();

        let bundle = Bundler::new(dir.path())
            .unwrap()
            .with_ignore_file(&dir.path().join(DEFAULT_IGNORE_FILE))
            .unwrap()
            .create_bundle("a")
            .unwrap();

        let paths: Vec<_> = bundle.manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec![".dockerignore", "Dockerfile", "agent.py"]);
    }

    #[test]
    fn test_bundler_deterministic() {
        let dir = create_test_dir();

        let first = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();
        let second = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.storage_key, second.storage_key);
        assert_eq!(first.archive, second.archive);
    }

    #[test]
    fn test_hash_ignores_mtime() {
        let dir = create_test_dir();
        let first = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        // Rewrite with identical content; mtime changes, hash must not
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("agent.py"), "print('hi')").unwrap();
        let second = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        assert_eq!(first.content_hash, second.content_hash);
    }

    #[test]
    fn test_content_change_changes_key() {
        let dir = create_test_dir();
        let first = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();
        fs::write(dir.path().join("agent.py"), "print('bye')").unwrap();
        let second = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        assert_ne!(first.content_hash, second.content_hash);
        assert_ne!(first.storage_key, second.storage_key);
    }

    #[test]
    fn test_archive_lists_sorted_entries() {
        let dir = create_test_dir();
        let bundle = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bundle.archive.clone())).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"tools/search.py".to_string()));
    }

    #[test]
    fn test_size_limit_enforced() {
        let dir = create_test_dir();
        let err = Bundler::new(dir.path())
            .unwrap()
            .with_max_bytes(8)
            .create_bundle("a")
            .unwrap_err();
        assert!(matches!(err, BundleError::SizeExceeded { limit_bytes: 8, .. }));
    }

    #[test]
    fn test_size_limit_zero_means_no_limit() {
        let dir = create_test_dir();
        let bundler = Bundler::new(dir.path()).unwrap().with_max_bytes(0);
        assert!(bundler.create_bundle("a").is_ok());
    }

    #[test]
    fn test_missing_root_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let err = Bundler::new(dir.path().join("nope"))
            .unwrap()
            .create_bundle("a")
            .unwrap_err();
        assert!(matches!(err, BundleError::UnreadableRoot { .. }));
    }

    #[test]
    fn test_require_entry() {
        let dir = create_test_dir();
        let bundle = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();
        assert!(bundle.require("Dockerfile").is_ok());
        assert!(matches!(
            bundle.require("Containerfile"),
            Err(BundleError::MissingEntry { .. })
        ));
    }

    #[cfg(unix)]
    mod symlink_tests {
        use super::*;
        use std::os::unix::fs::symlink;

        #[test]
        fn test_symlink_escape_rejected() {
            let outside = TempDir::new().unwrap();
            fs::write(outside.path().join("secret"), "x").unwrap();

            let dir = create_test_dir();
            symlink(outside.path().join("secret"), dir.path().join("escape_link")).unwrap();

            let err = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap_err();
            match err {
                BundleError::SymlinkEscapesRoot { path } => {
                    assert!(path.to_string_lossy().contains("escape_link"));
                }
                other => panic!("Expected SymlinkEscapesRoot, got {:?}", other),
            }
        }

        #[test]
        fn test_symlink_within_root_is_dereferenced() {
            let dir = create_test_dir();
            symlink("agent.py", dir.path().join("main.py")).unwrap();

            let bundle = Bundler::new(dir.path()).unwrap().create_bundle("a").unwrap();
            let linked = bundle.manifest.entries.iter().find(|e| e.path == "main.py").unwrap();
            let target = bundle.manifest.entries.iter().find(|e| e.path == "agent.py").unwrap();
            assert_eq!(linked.sha256, target.sha256);
        }
    }
}
