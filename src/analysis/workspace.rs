//! Workspace scanning and the ignore list.

use super::{analyze, CodeMetadata, DependencyAnalyzer, Language};
use crate::util::path_key;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::path::Path;
use walkdir::WalkDir;

pub const IGNORE_FILE: &str = ".codeloomignore";

/// Files larger than this are listed in the structure but not analyzed.
const MAX_ANALYZE_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "build",
    "dist",
    "out",
    "target",
    ".gradle",
    ".idea",
    ".vscode",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".next",
    "coverage",
    ".codeloom",
    "*.min.js",
    "*.lock",
];

/// Glob patterns from `.codeloomignore` merged with [`DEFAULT_EXCLUDES`].
///
/// A pattern matches when it matches the whole relative path or any single
/// path component.
pub struct IgnoreList {
    set: GlobSet,
    patterns: Vec<String>,
}

impl IgnoreList {
    pub fn load(root: &Path) -> Self {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        match std::fs::read_to_string(root.join(IGNORE_FILE)) {
            Ok(text) => patterns.extend(parse_ignore_file(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to read {}: {}", IGNORE_FILE, e),
        }
        Self::from_patterns(patterns)
    }

    pub fn from_patterns(patterns: Vec<String>) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Glob::new(&pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    kept.push(pattern);
                }
                Err(e) => tracing::warn!("Ignoring invalid ignore pattern '{}': {}", pattern, e),
            }
        }
        let set = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Failed to compile ignore list: {}", e);
            GlobSet::empty()
        });
        Self {
            set,
            patterns: kept,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// `relative` is workspace-relative.
    pub fn is_ignored(&self, relative: &Path) -> bool {
        let key = path_key(relative);
        if key.is_empty() {
            return false;
        }
        if self.set.is_match(&key) {
            return true;
        }
        key.split('/').any(|component| self.set.is_match(component))
    }
}

fn parse_ignore_file(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.trim_start_matches('/').trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty())
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Every non-ignored file, sorted.
    pub structure: Vec<String>,
    /// Metadata for every analyzed source file, sorted by path.
    pub metadata: Vec<CodeMetadata>,
}

/// Walk the workspace, analyze supported files in parallel, and feed the
/// results into the analyzer's matrix.
pub fn scan_workspace(root: &Path, ignore: &IgnoreList, analyzer: &DependencyAnalyzer) -> ScanResult {
    let mut structure = Vec::new();
    let mut sources = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            !ignore.is_ignored(rel)
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let key = path_key(rel);
        structure.push(key.clone());

        if !Language::from_path(entry.path()).is_supported() {
            continue;
        }
        let too_large = entry
            .metadata()
            .map(|m| m.len() > MAX_ANALYZE_BYTES)
            .unwrap_or(true);
        if !too_large {
            sources.push((key, entry.path().to_path_buf()));
        }
    }
    structure.sort();

    let mut metadata: Vec<CodeMetadata> = sources
        .par_iter()
        .filter_map(|(key, path)| {
            let content = std::fs::read_to_string(path).ok()?;
            Some(analyze(key, &content))
        })
        .collect();
    metadata.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    tracing::info!(
        root = %root.display(),
        files = structure.len(),
        analyzed = metadata.len(),
        "workspace scanned"
    );

    analyzer.clear(root);
    analyzer.update_many(root, metadata.clone());

    ScanResult {
        structure,
        metadata,
    }
}
