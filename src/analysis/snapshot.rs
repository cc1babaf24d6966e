//! Persisted project analysis (`.codeloom/project_analysis.json`)
//!
//! Saving and loading take an advisory lock on `.codeloom/.lock` so two
//! processes never interleave a write with a read.

use super::{CodeMetadata, DependencyAnalyzer, Language, ScanResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const SNAPSHOT_DIR: &str = ".codeloom";
pub const SNAPSHOT_FILE: &str = "project_analysis.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Node,
    Gradle,
    Maven,
    Python,
    Rust,
    Go,
    Unknown,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProjectType::Node => "node",
            ProjectType::Gradle => "gradle",
            ProjectType::Maven => "maven",
            ProjectType::Python => "python",
            ProjectType::Rust => "rust",
            ProjectType::Go => "go",
            ProjectType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Detect the project type from manifest files at the root.
pub fn detect_project_type(root: &Path) -> ProjectType {
    if root.join("package.json").exists() {
        ProjectType::Node
    } else if root.join("build.gradle").exists() || root.join("build.gradle.kts").exists() {
        ProjectType::Gradle
    } else if root.join("pom.xml").exists() {
        ProjectType::Maven
    } else if root.join("pyproject.toml").exists()
        || root.join("requirements.txt").exists()
        || root.join("setup.py").exists()
    {
        ProjectType::Python
    } else if root.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if root.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// Dependency names declared in the project's manifest. Best effort: an
/// unreadable or malformed manifest yields an empty list.
pub fn manifest_dependencies(root: &Path, project_type: ProjectType) -> Vec<String> {
    let mut names = BTreeSet::new();
    match project_type {
        ProjectType::Node => {
            if let Some(json) = read_json(&root.join("package.json")) {
                for section in ["dependencies", "devDependencies", "peerDependencies"] {
                    if let Some(deps) = json.get(section).and_then(|d| d.as_object()) {
                        names.extend(deps.keys().cloned());
                    }
                }
            }
        }
        ProjectType::Python => {
            if let Ok(text) = fs::read_to_string(root.join("requirements.txt")) {
                names.extend(text.lines().filter_map(requirement_name));
            }
            if let Some(doc) = read_toml(&root.join("pyproject.toml")) {
                let project_deps = doc
                    .get("project")
                    .and_then(|p| p.get("dependencies"))
                    .and_then(|d| d.as_array());
                for dep in project_deps.into_iter().flatten() {
                    if let Some(name) = dep.as_str().and_then(requirement_name) {
                        names.insert(name);
                    }
                }
                let poetry = doc
                    .get("tool")
                    .and_then(|t| t.get("poetry"))
                    .and_then(|p| p.get("dependencies"))
                    .and_then(|d| d.as_table());
                for key in poetry.into_iter().flat_map(|t| t.keys()) {
                    if key != "python" {
                        names.insert(key.clone());
                    }
                }
            }
        }
        ProjectType::Rust => {
            if let Some(doc) = read_toml(&root.join("Cargo.toml")) {
                for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
                    if let Some(table) = doc.get(section).and_then(|d| d.as_table()) {
                        names.extend(table.keys().cloned());
                    }
                }
            }
        }
        ProjectType::Go => {
            if let Ok(text) = fs::read_to_string(root.join("go.mod")) {
                names.extend(go_requirements(&text));
            }
        }
        ProjectType::Gradle | ProjectType::Maven | ProjectType::Unknown => {}
    }
    names.into_iter().collect()
}

fn read_json(path: &Path) -> Option<serde_json::Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn read_toml(path: &Path) -> Option<toml::Value> {
    let text = fs::read_to_string(path).ok()?;
    toml::from_str(&text).ok()
}

/// `requests>=2.0 ; python_version>"3"` -> `requests`
fn requirement_name(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    let end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(line.len());
    let name = &line[..end];
    (!name.is_empty()).then(|| name.to_string())
}

fn go_requirements(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_block = false;
    for line in text.lines().map(str::trim) {
        if line.starts_with("require (") {
            in_block = true;
            continue;
        }
        if in_block && line == ")" {
            in_block = false;
            continue;
        }
        let spec = if in_block {
            Some(line)
        } else {
            line.strip_prefix("require ")
        };
        if let Some(module) = spec.and_then(|s| s.split_whitespace().next()) {
            if !module.starts_with("//") {
                names.push(module.to_string());
            }
        }
    }
    names
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAnalysis {
    pub project_type: ProjectType,
    pub structure: Vec<String>,
    pub dependencies: Vec<String>,
    pub files: BTreeMap<String, FileSummary>,
    pub analyzed_at: DateTime<Utc>,
}

struct SnapshotLock {
    file: fs::File,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ProjectAnalysis {
    pub fn from_scan(root: &Path, scan: &ScanResult) -> Self {
        let project_type = detect_project_type(root);
        let files = scan
            .metadata
            .iter()
            .map(|m| {
                (
                    m.file_path.clone(),
                    FileSummary {
                        imports: m.imports.clone(),
                        exports: m.exports.clone(),
                        functions: m.functions.clone(),
                        classes: m.classes.clone(),
                    },
                )
            })
            .collect();
        Self {
            project_type,
            structure: scan.structure.clone(),
            dependencies: manifest_dependencies(root, project_type),
            files,
            analyzed_at: Utc::now(),
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(SNAPSHOT_DIR).join(SNAPSHOT_FILE)
    }

    fn lock(root: &Path, exclusive: bool) -> anyhow::Result<SnapshotLock> {
        let dir = root.join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => return Ok(SnapshotLock { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        anyhow::bail!(
                            "Timed out waiting for analysis lock ({}s)",
                            LOCK_TIMEOUT.as_secs()
                        );
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn save(&self, root: &Path) -> anyhow::Result<PathBuf> {
        let _lock = Self::lock(root, true)?;
        let path = Self::path(root);
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&path, &json)?;
        tracing::info!(path = %path.display(), files = self.files.len(), "project analysis saved");
        Ok(path)
    }

    /// `Ok(None)` when no snapshot has been saved yet.
    pub fn load(root: &Path) -> anyhow::Result<Option<Self>> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = Self::lock(root, false)?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let analysis = serde_json::from_str(&text)
            .with_context(|| format!("Corrupt project analysis at {}", path.display()))?;
        Ok(Some(analysis))
    }

    /// Seed the analyzer's matrix without re-scanning.
    pub fn seed(&self, root: &Path, analyzer: &DependencyAnalyzer) {
        let metadata = self
            .files
            .iter()
            .map(|(path, summary)| CodeMetadata {
                file_path: path.clone(),
                language: Language::from_path(Path::new(path)),
                imports: summary.imports.clone(),
                exports: summary.exports.clone(),
                functions: summary.functions.clone(),
                classes: summary.classes.clone(),
            })
            .collect();
        analyzer.clear(root);
        analyzer.update_many(root, metadata);
    }
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
