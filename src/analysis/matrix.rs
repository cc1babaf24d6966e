//! Workspace dependency matrix and blueprint
//!
//! The analyzer owns one matrix per workspace. Every metadata change
//! recomputes the whole dependency map, so `dependencies[f]` only ever
//! names files that are currently known.

use super::{CodeMetadata, Language};
use crate::util::{canonicalize_allow_missing, path_key};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyMatrix {
    pub files: BTreeMap<String, CodeMetadata>,
    /// File -> files it imports.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyMatrix {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files that import `path`, sorted.
    pub fn dependents_of(&self, path: &str) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.contains(path))
            .map(|(file, _)| file.clone())
            .collect()
    }

    fn recompute(&mut self) {
        let keys: Vec<&String> = self.files.keys().collect();
        let mut dependencies = BTreeMap::new();
        for (file, meta) in &self.files {
            let resolved: BTreeSet<String> = meta
                .imports
                .iter()
                .filter_map(|import| resolve_import(file, meta.language, import, &keys))
                .filter(|target| target != file)
                .collect();
            dependencies.insert(file.clone(), resolved);
        }
        self.dependencies = dependencies;
    }
}

/// Map an import string to a known file.
///
/// Relative imports are resolved against the importing file first; anything
/// else falls back to suffix matching on path components. When several files
/// match, the shortest path wins, then the lexicographically smallest.
pub fn resolve_import(from: &str, language: Language, import: &str, known: &[&String]) -> Option<String> {
    let import = import.trim();
    if import.is_empty() {
        return None;
    }

    if let Some(candidates) = relative_candidates(from, language, import) {
        for candidate in candidates {
            if known.iter().any(|k| k.as_str() == candidate) {
                return Some(candidate);
            }
        }
        return None;
    }

    let module = module_path(language, import)?;
    let mut matches: Vec<&String> = known
        .iter()
        .copied()
        .filter(|k| k.as_str() != from && module_matches(k, &module))
        .collect();

    // `com.acme.Util.helper` and Kotlin top-level members name a symbol
    // inside a file; retry without the last segment.
    if matches.is_empty() && matches!(language, Language::Java | Language::Kotlin | Language::Python) {
        if let Some((parent, _)) = module.rsplit_once('/') {
            matches = known
                .iter()
                .copied()
                .filter(|k| k.as_str() != from && module_matches(k, parent))
                .collect();
        }
    }

    matches
        .into_iter()
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .cloned()
}

/// Concrete candidate keys for `./x`, `../x` and Python `.x` imports, in
/// preference order. `None` when the import is not relative.
fn relative_candidates(from: &str, language: Language, import: &str) -> Option<Vec<String>> {
    let dir = Path::new(from).parent().unwrap_or_else(|| Path::new(""));

    let base = match language {
        Language::Python if import.starts_with('.') => {
            let dots = import.chars().take_while(|c| *c == '.').count();
            let rest = import[dots..].replace('.', "/");
            let mut base = dir.to_path_buf();
            for _ in 1..dots {
                base.pop();
            }
            if rest.is_empty() {
                base.join("__init__")
            } else {
                base.join(rest)
            }
        }
        Language::JavaScript | Language::TypeScript
            if import.starts_with("./") || import.starts_with("../") =>
        {
            dir.join(import)
        }
        _ => return None,
    };

    let base = path_key(&base);
    let mut candidates = vec![base.clone()];
    for ext in language.module_extensions() {
        candidates.push(format!("{}.{}", base, ext));
    }
    let index = if language == Language::Python { "__init__" } else { "index" };
    for ext in language.module_extensions() {
        candidates.push(format!("{}/{}.{}", base, index, ext));
    }
    Some(candidates)
}

/// Slash-separated module path for a non-relative import, or `None` for
/// imports that name external packages.
fn module_path(language: Language, import: &str) -> Option<String> {
    match language {
        Language::JavaScript | Language::TypeScript => {
            let stripped = ["@/", "~/", "src/"]
                .iter()
                .find_map(|prefix| import.strip_prefix(prefix));
            match stripped {
                Some(rest) => Some(rest.to_string()),
                // Bare single-segment specifiers are packages.
                None if !import.contains('/') || import.starts_with('@') => None,
                None => Some(import.to_string()),
            }
        }
        Language::Python | Language::Java | Language::Kotlin => {
            let trimmed = import.trim_end_matches(".*");
            if trimmed.is_empty() {
                return None;
            }
            Some(trimmed.replace('.', "/"))
        }
        Language::Unknown => None,
    }
}

/// `key` without its extension (and without a trailing `index`/`__init__`)
/// ends with `module` on a component boundary.
fn module_matches(key: &str, module: &str) -> bool {
    let stem = match key.rsplit_once('.') {
        Some((stem, ext)) if !ext.contains('/') => stem,
        _ => key,
    };
    let stems = [
        Some(stem),
        stem.strip_suffix("/index"),
        stem.strip_suffix("/__init__"),
    ];
    stems.into_iter().flatten().any(|s| {
        s == module
            || (s.ends_with(module)
                && s.as_bytes().get(s.len() - module.len() - 1) == Some(&b'/'))
    })
}

/// Process-wide owner of every workspace matrix.
#[derive(Default)]
pub struct DependencyAnalyzer {
    matrices: RwLock<HashMap<PathBuf, DependencyMatrix>>,
}

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn workspace_key(root: &Path) -> PathBuf {
        canonicalize_allow_missing(root).unwrap_or_else(|_| root.to_path_buf())
    }

    fn with_matrix_mut<T>(&self, root: &Path, f: impl FnOnce(&mut DependencyMatrix) -> T) -> T {
        let key = Self::workspace_key(root);
        let mut matrices = self
            .matrices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(matrices.entry(key).or_default())
    }

    pub fn analyze(&self, file_path: &str, content: &str) -> CodeMetadata {
        super::analyze(file_path, content)
    }

    pub fn update_matrix(&self, root: &Path, metadata: CodeMetadata) {
        self.update_many(root, vec![metadata]);
    }

    /// Merge several files and recompute once.
    pub fn update_many(&self, root: &Path, metadata: Vec<CodeMetadata>) {
        let count = metadata.len();
        self.with_matrix_mut(root, |matrix| {
            for mut meta in metadata {
                meta.file_path = path_key(Path::new(&meta.file_path));
                matrix.files.insert(meta.file_path.clone(), meta);
            }
            matrix.recompute();
        });
        tracing::debug!(root = %root.display(), files = count, "dependency matrix updated");
    }

    /// Returns whether the file was known.
    pub fn remove_file(&self, root: &Path, file_path: &str) -> bool {
        let key = path_key(Path::new(file_path));
        self.with_matrix_mut(root, |matrix| {
            let removed = matrix.files.remove(&key).is_some();
            if removed {
                matrix.recompute();
            }
            removed
        })
    }

    pub fn clear(&self, root: &Path) {
        self.with_matrix_mut(root, |matrix| *matrix = DependencyMatrix::default());
    }

    /// Snapshot of the workspace matrix (empty if never populated).
    pub fn matrix(&self, root: &Path) -> DependencyMatrix {
        let key = Self::workspace_key(root);
        let matrices = self
            .matrices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        matrices.get(&key).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, root: &Path, file_path: &str) -> Vec<String> {
        self.matrix(root)
            .dependents_of(&path_key(Path::new(file_path)))
    }

    /// Deterministic text summary of the matrix for the model. Advisory
    /// only; nothing checks generated code against it.
    pub fn generate_blueprint(&self, root: &Path) -> String {
        render_blueprint(&self.matrix(root))
    }
}

pub fn render_blueprint(matrix: &DependencyMatrix) -> String {
    let mut out = String::new();
    out.push_str("# Project Blueprint\n\n");
    if matrix.is_empty() {
        out.push_str("No source files have been analyzed yet.\n");
        return out;
    }
    let _ = writeln!(out, "Files: {}\n", matrix.files.len());

    for (path, meta) in &matrix.files {
        let _ = writeln!(out, "## {} ({})", path, meta.language.name());
        write_list(&mut out, "imports", &meta.imports);
        write_list(&mut out, "exports", &meta.exports);
        write_list(&mut out, "functions", &meta.functions);
        write_list(&mut out, "classes", &meta.classes);
        if let Some(deps) = matrix.dependencies.get(path) {
            let deps: Vec<String> = deps.iter().cloned().collect();
            write_list(&mut out, "depends on", &deps);
        }
        let users = matrix.dependents_of(path);
        write_list(&mut out, "used by", &users);
        out.push('\n');
    }

    out.push_str(
        "RULE: When generating or modifying code, only reference exports and functions \
         listed in this blueprint. If something you need is missing, create it explicitly \
         in the same change instead of assuming it exists.\n",
    );
    out
}

fn write_list(out: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "- {}: {}", label, items.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn relative_js_imports_resolve_with_extensions_and_index() {
        let known = keys(&["routes/main.js", "db.js", "lib/index.ts"]);
        let refs: Vec<&String> = known.iter().collect();
        assert_eq!(
            resolve_import("routes/main.js", Language::JavaScript, "../db", &refs),
            Some("db.js".to_string())
        );
        assert_eq!(
            resolve_import("routes/main.js", Language::JavaScript, "../lib", &refs),
            Some("lib/index.ts".to_string())
        );
        assert_eq!(
            resolve_import("routes/main.js", Language::JavaScript, "./missing", &refs),
            None
        );
        assert_eq!(
            resolve_import("routes/main.js", Language::JavaScript, "express", &refs),
            None
        );
    }

    #[test]
    fn python_relative_and_dotted_imports() {
        let known = keys(&["app/models.py", "app/db/__init__.py", "app/service.py"]);
        let refs: Vec<&String> = known.iter().collect();
        assert_eq!(
            resolve_import("app/service.py", Language::Python, ".models", &refs),
            Some("app/models.py".to_string())
        );
        assert_eq!(
            resolve_import("app/service.py", Language::Python, "app.db", &refs),
            Some("app/db/__init__.py".to_string())
        );
        assert_eq!(
            resolve_import("app/service.py", Language::Python, "os", &refs),
            None
        );
    }

    #[test]
    fn ambiguous_suffix_prefers_shortest_then_lexicographic() {
        let known = keys(&[
            "src/main/java/com/acme/Util.java",
            "lib/com/acme/Util.java",
            "alt/com/acme/Util.java",
        ]);
        let refs: Vec<&String> = known.iter().collect();
        assert_eq!(
            resolve_import("x/Main.java", Language::Java, "com.acme.Util", &refs),
            Some("alt/com/acme/Util.java".to_string())
        );
        // Static member import falls back to the owning file.
        assert_eq!(
            resolve_import("x/Main.java", Language::Java, "com.acme.Util.trim", &refs),
            Some("alt/com/acme/Util.java".to_string())
        );
    }

    #[test]
    fn suffix_match_respects_component_boundaries() {
        assert!(module_matches("src/utils/db.ts", "utils/db"));
        assert!(!module_matches("src/myutils/db.ts", "utils/db"));
        assert!(module_matches("pkg/api/__init__.py", "pkg/api"));
    }

    #[test]
    fn matrix_tracks_dependencies_and_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = DependencyAnalyzer::new();
        analyzer.update_matrix(dir.path(), analyze("db.js", "export function query() {}"));
        analyzer.update_matrix(
            dir.path(),
            analyze("routes/main.js", "import { query } from '../db';\nimport x from './gone';"),
        );

        let matrix = analyzer.matrix(dir.path());
        assert_eq!(matrix.files.len(), 2);
        let deps = &matrix.dependencies["routes/main.js"];
        assert_eq!(deps.iter().collect::<Vec<_>>(), vec!["db.js"]);
        assert_eq!(analyzer.dependents_of(dir.path(), "db.js"), vec!["routes/main.js"]);

        // Every dependency names a known file.
        for targets in matrix.dependencies.values() {
            for target in targets {
                assert!(matrix.files.contains_key(target));
            }
        }

        assert!(analyzer.remove_file(dir.path(), "db.js"));
        let matrix = analyzer.matrix(dir.path());
        assert!(matrix.dependencies["routes/main.js"].is_empty());
        assert!(!analyzer.remove_file(dir.path(), "db.js"));
    }

    #[test]
    fn blueprint_is_sorted_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = DependencyAnalyzer::new();
        let files = [
            ("b.py", "from a import helper\n\ndef run():\n    pass\n"),
            ("a.py", "def helper():\n    pass\n\nclass Thing:\n    pass\n"),
        ];
        for (path, src) in files {
            analyzer.update_matrix(dir.path(), analyze(path, src));
        }
        let first = analyzer.generate_blueprint(dir.path());
        for (path, src) in files {
            analyzer.update_matrix(dir.path(), analyze(path, src));
        }
        let second = analyzer.generate_blueprint(dir.path());
        assert_eq!(first, second);

        let a = first.find("## a.py").unwrap();
        let b = first.find("## b.py").unwrap();
        assert!(a < b);
        assert!(first.contains("- depends on: a.py"));
        assert!(first.contains("- used by: b.py"));
        assert!(first.contains("RULE:"));
    }

    #[test]
    fn workspaces_are_isolated() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        let analyzer = DependencyAnalyzer::new();
        analyzer.update_matrix(one.path(), analyze("a.ts", "export const x = 1;"));
        assert_eq!(analyzer.matrix(one.path()).files.len(), 1);
        assert!(analyzer.matrix(two.path()).is_empty());
        assert!(analyzer
            .generate_blueprint(two.path())
            .contains("No source files"));
    }
}
