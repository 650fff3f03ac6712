//! Ignore rules for source bundling
//!
//! Built-in exclusions plus patterns read from a project-local ignore
//! file in `.dockerignore` style: one glob per line, `#` comments, a
//! leading `!` re-includes, and a bare name also matches everything
//! beneath it.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Ignore file read when the project does not name one
pub const DEFAULT_IGNORE_FILE: &str = ".dockerignore";

/// Paths never shipped to the build service
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".DS_Store",
    "**/.DS_Store",
    "__pycache__",
    "**/__pycache__",
    "**/*.pyc",
    ".venv",
    "venv",
    ".env",
    "node_modules",
    "**/node_modules",
    ".pytest_cache",
    ".mypy_cache",
    ".agent-launch/state.json",
    "target",
];

/// Errors for ignore rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("cannot read ignore file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ignore pattern: {0}")]
    Glob(#[from] globset::Error),
}

/// Compiled ignore rules
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    negations: Vec<String>,
    excluded: GlobSet,
    reincluded: GlobSet,
}

impl ExcludeRules {
    /// Rules containing only the built-in exclusions
    pub fn new() -> Result<Self, ExcludeError> {
        Self::build(Vec::new(), Vec::new())
    }

    /// Add the patterns of an ignore file
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path)?;
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        self.with_patterns(&lines)
    }

    /// Add patterns; `!pattern` re-includes paths matched earlier
    pub fn with_patterns(self, patterns: &[&str]) -> Result<Self, ExcludeError> {
        let mut excludes = self.patterns;
        let mut negations = self.negations;
        for raw in patterns {
            match raw.strip_prefix('!') {
                Some(neg) => negations.push(normalize(neg)),
                None => excludes.push(normalize(raw)),
            }
        }
        Self::build(excludes, negations)
    }

    fn build(patterns: Vec<String>, negations: Vec<String>) -> Result<Self, ExcludeError> {
        let mut excluded = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES.iter().copied().chain(patterns.iter().map(String::as_str)) {
            add_with_descendants(&mut excluded, pattern)?;
        }

        let mut reincluded = GlobSetBuilder::new();
        for pattern in &negations {
            add_with_descendants(&mut reincluded, pattern)?;
        }

        Ok(Self {
            excluded: excluded.build()?,
            reincluded: reincluded.build()?,
            patterns,
            negations,
        })
    }

    /// Check if a root-relative path should be left out of the bundle
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy().replace('\\', "/");
        self.excluded.is_match(path_str.as_str()) && !self.reincluded.is_match(path_str.as_str())
    }

    /// Whether a directory may be skipped without visiting its children
    ///
    /// A directory cannot be pruned while some negation could re-include
    /// one of its descendants.
    pub fn can_prune(&self, dir: &Path) -> bool {
        self.negations.is_empty() && self.is_excluded(dir)
    }
}

/// Strip the anchoring slash and trailing slash a `.dockerignore` line may carry
fn normalize(pattern: &str) -> String {
    pattern.trim().trim_start_matches('/').trim_end_matches('/').to_string()
}

fn add_with_descendants(builder: &mut GlobSetBuilder, pattern: &str) -> Result<(), ExcludeError> {
    if pattern.is_empty() {
        return Ok(());
    }
    builder.add(Glob::new(pattern)?);
    builder.add(Glob::new(&format!("{}/**", pattern))?);
    Ok(())
}
