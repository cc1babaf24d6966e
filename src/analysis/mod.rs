//! Lightweight static scan
//!
//! Regex extraction of imports, exports, functions and classes. This is a
//! heuristic hint layer used to build the dependency blueprint handed to the
//! model; it does not parse and it will miss or misread unusual code.

pub mod matrix;
pub mod snapshot;
pub mod workspace;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

pub use matrix::{DependencyAnalyzer, DependencyMatrix};
pub use snapshot::{ProjectAnalysis, ProjectType};
pub use workspace::{scan_workspace, IgnoreList, ScanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Java,
    Kotlin,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "java" => Language::Java,
            "kt" | "kts" => Language::Kotlin,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::Unknown => "unknown",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Language::Unknown)
    }

    /// Extensions tried when resolving an extensionless import.
    pub(crate) fn module_extensions(&self) -> &'static [&'static str] {
        match self {
            Language::JavaScript | Language::TypeScript => {
                &["ts", "tsx", "js", "jsx", "mjs", "cjs", "mts", "cts"]
            }
            Language::Python => &["py", "pyi"],
            Language::Java => &["java"],
            Language::Kotlin => &["kt", "kts"],
            Language::Unknown => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMetadata {
    /// Normalized, forward-slash, workspace-relative path.
    pub file_path: String,
    pub language: Language,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
}

impl CodeMetadata {
    pub fn empty(file_path: impl Into<String>, language: Language) -> Self {
        Self {
            file_path: file_path.into(),
            language,
            imports: Vec::new(),
            exports: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
        }
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static JS_IMPORT_FROM: LazyLock<Regex> =
    LazyLock::new(|| re(r#"(?m)^\s*(?:import|export)\b[^'"`;]*?\bfrom\s*['"]([^'"]+)['"]"#));
static JS_IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| re(r#"(?m)^\s*import\s*['"]([^'"]+)['"]"#));
static JS_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| re(r#"\b(?:require|import)\s*\(\s*['"]([^'"]+)['"]\s*\)"#));
static JS_EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|const|let|var|interface|type|enum)\s+([A-Za-z_$][\w$]*)")
});
static JS_EXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^\s*export\s*\{([^}]*)\}"));
static JS_COMMONJS_EXPORT: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*(?:module\.)?exports\.([A-Za-z_$][\w$]*)\s*="));
static JS_MODULE_EXPORTS: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*module\.exports\s*=\s*\{([^}]*)\}"));
static JS_MODULE_EXPORTS_NAME: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*module\.exports\s*=\s*([A-Za-z_$][\w$]*)\s*;?\s*$"));
static JS_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+([A-Za-z_$][\w$]*)\s*\("));
static JS_ARROW: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)")
});
static JS_CLASS: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)"));

static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^\s*import\s+([\w.]+(?:\s*,\s*[\w.]+)*)"));
static PY_FROM: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^\s*from\s+(\.*[\w.]*)\s+import\b"));
static PY_DEF: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^([ \t]*)(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\("));
static PY_CLASS: LazyLock<Regex> = LazyLock::new(|| re(r"(?m)^([ \t]*)class\s+([A-Za-z_]\w*)"));
static PY_ALL: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)__all__\s*=\s*[\[(](.*?)[\])]"));

static JVM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?m)^\s*import\s+(?:static\s+)?([\w.]+(?:\.\*)?)(?:\s+as\s+\w+)?\s*;?"));
static JAVA_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^\s*((?:(?:public|protected|private|abstract|final|static|sealed|non-sealed)\s+)*)(?:class|interface|enum|record|@interface)\s+([A-Za-z_]\w*)")
});
static JAVA_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^\s*((?:(?:public|protected|private|static|final|abstract|synchronized|native|default)\s+)+)(?:<[^>]+>\s+)?[\w<>\[\],.?\s]+?\s+([a-zA-Z_]\w*)\s*\(")
});
static KOTLIN_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^\s*((?:(?:public|private|internal|protected|abstract|open|sealed|data|enum|annotation|inner|value|inline)\s+)*)(?:class|interface|object)\s+([A-Za-z_]\w*)")
});
static KOTLIN_FUN: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^([ \t]*)((?:(?:public|private|internal|protected|override|open|suspend|inline|operator|infix|tailrec|abstract|final)\s+)*)fun\s+(?:<[^>]+>\s*)?(?:[\w.<>?]+\.)?([A-Za-z_]\w*)\s*\(")
});

/// Extract metadata for one file. Unsupported languages yield an empty
/// record rather than an error.
pub fn analyze(file_path: &str, content: &str) -> CodeMetadata {
    let language = Language::from_path(Path::new(file_path));
    let mut meta = CodeMetadata::empty(file_path, language);
    match language {
        Language::JavaScript | Language::TypeScript => analyze_js(content, &mut meta),
        Language::Python => analyze_python(content, &mut meta),
        Language::Java => analyze_java(content, &mut meta),
        Language::Kotlin => analyze_kotlin(content, &mut meta),
        Language::Unknown => {}
    }
    meta
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

/// Names from `{ a, b as c, default as d }`; the exported name is the alias.
fn export_list_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').filter_map(|item| {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        let name = match item.split_once(" as ") {
            Some((_, alias)) => alias.trim(),
            None => item.split(':').next().unwrap_or(item).trim(),
        };
        Some(name)
    })
}

fn analyze_js(content: &str, meta: &mut CodeMetadata) {
    for caps in JS_IMPORT_FROM
        .captures_iter(content)
        .chain(JS_IMPORT_BARE.captures_iter(content))
        .chain(JS_REQUIRE.captures_iter(content))
    {
        push_unique(&mut meta.imports, &caps[1]);
    }

    for caps in JS_EXPORT_DECL.captures_iter(content) {
        push_unique(&mut meta.exports, &caps[1]);
    }
    for caps in JS_EXPORT_LIST
        .captures_iter(content)
        .chain(JS_MODULE_EXPORTS.captures_iter(content))
    {
        for name in export_list_names(&caps[1]) {
            push_unique(&mut meta.exports, name);
        }
    }
    for caps in JS_COMMONJS_EXPORT
        .captures_iter(content)
        .chain(JS_MODULE_EXPORTS_NAME.captures_iter(content))
    {
        push_unique(&mut meta.exports, &caps[1]);
    }

    for caps in JS_FUNCTION
        .captures_iter(content)
        .chain(JS_ARROW.captures_iter(content))
    {
        push_unique(&mut meta.functions, &caps[1]);
    }
    for caps in JS_CLASS.captures_iter(content) {
        push_unique(&mut meta.classes, &caps[1]);
    }
}

fn analyze_python(content: &str, meta: &mut CodeMetadata) {
    for caps in PY_IMPORT.captures_iter(content) {
        for module in caps[1].split(',') {
            push_unique(&mut meta.imports, module);
        }
    }
    for caps in PY_FROM.captures_iter(content) {
        push_unique(&mut meta.imports, &caps[1]);
    }

    let mut top_level = Vec::new();
    for caps in PY_DEF.captures_iter(content) {
        let name = &caps[2];
        push_unique(&mut meta.functions, name);
        if caps[1].is_empty() {
            top_level.push(name.to_string());
        }
    }
    for caps in PY_CLASS.captures_iter(content) {
        let name = &caps[2];
        push_unique(&mut meta.classes, name);
        if caps[1].is_empty() {
            top_level.push(name.to_string());
        }
    }

    // `__all__` is authoritative; otherwise every public top-level name.
    if let Some(caps) = PY_ALL.captures(content) {
        for item in caps[1].split(',') {
            push_unique(&mut meta.exports, item.trim().trim_matches(|c| c == '"' || c == '\''));
        }
    } else {
        for name in top_level.iter().filter(|n| !n.starts_with('_')) {
            push_unique(&mut meta.exports, name);
        }
    }
}

fn analyze_java(content: &str, meta: &mut CodeMetadata) {
    for caps in JVM_IMPORT.captures_iter(content) {
        push_unique(&mut meta.imports, &caps[1]);
    }
    for caps in JAVA_TYPE.captures_iter(content) {
        let name = &caps[2];
        push_unique(&mut meta.classes, name);
        if caps[1].contains("public") {
            push_unique(&mut meta.exports, name);
        }
    }
    for caps in JAVA_METHOD.captures_iter(content) {
        let modifiers = &caps[1];
        let name = &caps[2];
        // `new Foo(` and control keywords are not declarations.
        if matches!(name, "if" | "for" | "while" | "switch" | "catch" | "return" | "new") {
            continue;
        }
        push_unique(&mut meta.functions, name);
        if modifiers.contains("public") {
            push_unique(&mut meta.exports, name);
        }
    }
}

fn analyze_kotlin(content: &str, meta: &mut CodeMetadata) {
    for caps in JVM_IMPORT.captures_iter(content) {
        push_unique(&mut meta.imports, &caps[1]);
    }
    for caps in KOTLIN_TYPE.captures_iter(content) {
        let name = &caps[2];
        push_unique(&mut meta.classes, name);
        if !is_kotlin_hidden(&caps[1]) {
            push_unique(&mut meta.exports, name);
        }
    }
    for caps in KOTLIN_FUN.captures_iter(content) {
        let name = &caps[3];
        push_unique(&mut meta.functions, name);
        if caps[1].is_empty() && !is_kotlin_hidden(&caps[2]) {
            push_unique(&mut meta.exports, name);
        }
    }
}

fn is_kotlin_hidden(modifiers: &str) -> bool {
    modifiers
        .split_whitespace()
        .any(|m| m == "private" || m == "internal")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_compiles() {
        let patterns: [&LazyLock<Regex>; 21] = [
            &JS_IMPORT_FROM,
            &JS_IMPORT_BARE,
            &JS_REQUIRE,
            &JS_EXPORT_DECL,
            &JS_EXPORT_LIST,
            &JS_COMMONJS_EXPORT,
            &JS_MODULE_EXPORTS,
            &JS_MODULE_EXPORTS_NAME,
            &JS_FUNCTION,
            &JS_ARROW,
            &JS_CLASS,
            &PY_IMPORT,
            &PY_FROM,
            &PY_DEF,
            &PY_CLASS,
            &PY_ALL,
            &JVM_IMPORT,
            &JAVA_TYPE,
            &JAVA_METHOD,
            &KOTLIN_TYPE,
            &KOTLIN_FUN,
        ];
        for pattern in patterns {
            assert!(!pattern.is_match(""), "{} matches empty input", pattern.as_str());
        }
    }

    #[test]
    fn javascript_extraction() {
        let src = r#"
import express from 'express';
import { query } from "./db";
const helpers = require('../lib/helpers');
import './styles.css';

export function handler(req, res) {}
export const route = async (req) => {};
function internal() {}
const arrow = x => x * 2;
export class Router {}
export { internal as publicInternal, arrow };
module.exports.legacy = handler;
"#;
        let meta = analyze("routes/main.js", src);
        assert_eq!(meta.language, Language::JavaScript);
        assert_eq!(
            meta.imports,
            vec!["express", "./db", "./styles.css", "../lib/helpers"]
        );
        for name in ["handler", "route", "Router", "publicInternal", "arrow", "legacy"] {
            assert!(meta.exports.contains(&name.to_string()), "missing export {name}");
        }
        for name in ["handler", "internal", "route", "arrow"] {
            assert!(meta.functions.contains(&name.to_string()), "missing fn {name}");
        }
        assert_eq!(meta.classes, vec!["Router"]);
    }

    #[test]
    fn typescript_types_are_exports() {
        let src = "export interface User { id: number }\nexport type Id = string;\nexport default class Store {}\n";
        let meta = analyze("src/store.ts", src);
        assert_eq!(meta.language, Language::TypeScript);
        assert_eq!(meta.exports, vec!["User", "Id", "Store"]);
        assert_eq!(meta.classes, vec!["Store"]);
    }

    #[test]
    fn python_extraction() {
        let src = "import os, sys\nfrom .models import User\nfrom app.db import session\n\nclass Service:\n    def run(self):\n        pass\n\ndef _private():\n    pass\n\nasync def fetch(url):\n    pass\n";
        let meta = analyze("app/service.py", src);
        assert_eq!(meta.imports, vec!["os", "sys", ".models", "app.db"]);
        assert_eq!(meta.classes, vec!["Service"]);
        assert_eq!(meta.functions, vec!["run", "_private", "fetch"]);
        assert_eq!(meta.exports, vec!["fetch", "Service"]);
    }

    #[test]
    fn python_all_overrides_exports() {
        let src = "__all__ = ['fetch']\n\ndef fetch():\n    pass\n\ndef other():\n    pass\n";
        let meta = analyze("pkg/api.py", src);
        assert_eq!(meta.exports, vec!["fetch"]);
    }

    #[test]
    fn java_extraction() {
        let src = "package com.acme;\n\nimport java.util.List;\nimport static com.acme.util.Strings.trim;\n\npublic class UserService {\n    private final Repo repo;\n    public List<User> findAll() {\n        if (x) { return null; }\n    }\n    private static void helper(int a) {}\n}\n";
        let meta = analyze("src/main/java/com/acme/UserService.java", src);
        assert_eq!(meta.imports, vec!["java.util.List", "com.acme.util.Strings.trim"]);
        assert_eq!(meta.classes, vec!["UserService"]);
        assert_eq!(meta.functions, vec!["findAll", "helper"]);
        assert_eq!(meta.exports, vec!["UserService", "findAll"]);
    }

    #[test]
    fn kotlin_extraction() {
        let src = "import com.acme.data.Repo\n\ndata class User(val id: Int)\nprivate class Hidden\nfun greet(name: String) = \"hi\"\nprivate fun secret() {}\nsuspend fun load() {}\nclass Box {\n    fun open() {}\n}\n";
        let meta = analyze("app/User.kt", src);
        assert_eq!(meta.imports, vec!["com.acme.data.Repo"]);
        assert_eq!(meta.classes, vec!["User", "Hidden", "Box"]);
        assert_eq!(meta.functions, vec!["greet", "secret", "load", "open"]);
        assert_eq!(meta.exports, vec!["User", "Box", "greet", "load"]);
    }

    #[test]
    fn unknown_language_is_empty() {
        let meta = analyze("README.md", "import x from 'y'");
        assert_eq!(meta.language, Language::Unknown);
        assert!(meta.imports.is_empty());
        assert!(meta.exports.is_empty());
    }
}
