//! Tools the model can call
//!
//! Every tool validates its raw JSON arguments into a typed [`ToolParams`]
//! variant before anything runs, and reports failures as a [`ToolResult`]
//! carrying an error so the model can read it and adjust.

pub mod blueprint;
pub mod edit;
pub mod fs;
pub mod search;
pub mod shell;

use crate::analysis::{DependencyAnalyzer, IgnoreList};
use crate::coherence::{CoherenceError, FileCoherenceManager, FileVersion};
use crate::error::ErrorKind;
use crate::fuzzy::MatchOptions;
use crate::llm::FunctionDeclaration;
use crate::util::{path_key, resolve_workspace_path, WorkspacePath};
use async_trait::async_trait;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    pub kind: ErrorKind,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled")
    }
}

impl From<CoherenceError> for ToolError {
    fn from(err: CoherenceError) -> Self {
        let kind = match &err {
            CoherenceError::NotFound(_) => ErrorKind::FileNotFound,
            CoherenceError::VersionConflict { .. } => ErrorKind::InvalidParameters,
            CoherenceError::Io { .. } => ErrorKind::ToolExecution,
        };
        let mut message = err.to_string();
        if let CoherenceError::VersionConflict { .. } = err {
            message.push_str(". Read the file again and retry with the new version.");
        }
        Self::new(kind, message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    /// Sent back to the model.
    pub content: String,
    /// Short human-readable form for the host.
    pub display_text: String,
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>, display_text: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            display_text: display_text.into(),
            error: None,
        }
    }

    pub fn failure(error: ToolError) -> Self {
        Self {
            content: String::new(),
            display_text: format!("{}: {}", error.kind.label(), error.message),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Payload of the `functionResponse` part.
    pub fn to_model_response(&self) -> Value {
        match &self.error {
            Some(err) => json!({ "error": err.message, "kind": err.kind }),
            None => json!({ "content": self.content }),
        }
    }
}

impl From<Result<ToolResult, ToolError>> for ToolResult {
    fn from(result: Result<ToolResult, ToolError>) -> Self {
        result.unwrap_or_else(ToolResult::failure)
    }
}

#[derive(Debug, Clone)]
pub struct ReadFileParams {
    pub path: String,
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct WriteFileParams {
    pub path: String,
    pub content: String,
    /// `None`: the file must not exist yet.
    pub expected_version: Option<FileVersion>,
}

#[derive(Debug, Clone)]
pub struct EditFileParams {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
    pub line_hint: Option<usize>,
    pub expected_version: Option<FileVersion>,
}

#[derive(Debug, Clone)]
pub struct ListDirectoryParams {
    pub path: String,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub pattern: Regex,
    pub path: String,
    pub max_results: usize,
}

#[derive(Debug, Clone)]
pub struct ShellParams {
    pub command: String,
    pub timeout: Option<Duration>,
}

/// Validated arguments, one variant per built-in tool.
#[derive(Debug, Clone)]
pub enum ToolParams {
    ReadFile(ReadFileParams),
    WriteFile(WriteFileParams),
    EditFile(EditFileParams),
    ListDirectory(ListDirectoryParams),
    SearchFiles(SearchParams),
    RunShell(ShellParams),
    GetBlueprint,
}

/// Paths a call touches, as forward-slash workspace keys (`""` is the
/// whole workspace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAccess {
    Read(Vec<String>),
    Write(Vec<String>),
    /// Unknown footprint; runs alone.
    Exclusive,
}

impl ToolAccess {
    fn paths(&self) -> &[String] {
        match self {
            ToolAccess::Read(paths) | ToolAccess::Write(paths) => paths,
            ToolAccess::Exclusive => &[],
        }
    }

    /// Two calls may run concurrently only when neither is exclusive and
    /// they share no path (a directory shares with everything below it).
    pub fn conflicts_with(&self, other: &ToolAccess) -> bool {
        if matches!(self, ToolAccess::Exclusive) || matches!(other, ToolAccess::Exclusive) {
            return true;
        }
        self.paths()
            .iter()
            .any(|a| other.paths().iter().any(|b| paths_overlap(a, b)))
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }
    let nested = |outer: &str, inner: &str| {
        inner.starts_with(outer) && inner.as_bytes().get(outer.len()) == Some(&b'/')
    };
    nested(a, b) || nested(b, a)
}

impl ToolParams {
    pub fn access(&self) -> ToolAccess {
        match self {
            ToolParams::ReadFile(p) => ToolAccess::Read(vec![key(&p.path)]),
            ToolParams::WriteFile(p) => ToolAccess::Write(vec![key(&p.path)]),
            ToolParams::EditFile(p) => ToolAccess::Write(vec![key(&p.path)]),
            ToolParams::ListDirectory(p) => ToolAccess::Read(vec![key(&p.path)]),
            ToolParams::SearchFiles(p) => ToolAccess::Read(vec![key(&p.path)]),
            ToolParams::RunShell(_) => ToolAccess::Exclusive,
            ToolParams::GetBlueprint => ToolAccess::Read(vec![String::new()]),
        }
    }
}

fn key(path: &str) -> String {
    path_key(Path::new(path))
}

/// Sink for progress lines from long-running tools.
pub type ProgressSink = mpsc::UnboundedSender<String>;

#[derive(Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub coherence: Arc<FileCoherenceManager>,
    pub analyzer: Arc<DependencyAnalyzer>,
    pub ignore: Arc<IgnoreList>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
    pub shell_timeout: Duration,
    pub max_output_bytes: usize,
    pub fuzzy: MatchOptions,
}

impl ToolContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        coherence: Arc<FileCoherenceManager>,
        analyzer: Arc<DependencyAnalyzer>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let ignore = Arc::new(IgnoreList::load(&workspace_root));
        Self {
            workspace_root,
            coherence,
            analyzer,
            ignore,
            cancel: CancellationToken::new(),
            progress: None,
            shell_timeout: Duration::from_secs(60),
            max_output_bytes: 16_000,
            fuzzy: MatchOptions::default(),
        }
    }

    pub fn resolve(&self, path: &str) -> Result<WorkspacePath, ToolError> {
        resolve_workspace_path(&self.workspace_root, Path::new(path)).map_err(ToolError::invalid)
    }

    pub fn report(&self, line: impl Into<String>) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(line.into());
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments object.
    fn parameter_schema(&self) -> Value;

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError>;

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult;

    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameter_schema(),
        }
    }
}

/// Name -> tool lookup, in registration order for declarations.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: BTreeMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(fs::ReadFileTool));
        registry.register(Arc::new(fs::WriteFileTool));
        registry.register(Arc::new(edit::EditFileTool));
        registry.register(Arc::new(fs::ListDirectoryTool));
        registry.register(Arc::new(search::SearchFilesTool));
        registry.register(Arc::new(shell::RunShellTool));
        registry.register(Arc::new(blueprint::GetBlueprintTool));
        registry
    }

    /// Registering a name twice replaces the earlier tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.index.get(tool.name()) {
            Some(&i) => self.tools[i] = tool,
            None => {
                self.index.insert(tool.name(), self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| self.tools[i].clone())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.iter().map(|t| t.declaration()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Deserialize a tool's raw arguments with a readable error.
pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, raw: &Value) -> Result<T, ToolError> {
    let raw = if raw.is_null() { json!({}) } else { raw.clone() };
    serde_json::from_value(raw)
        .map_err(|e| ToolError::invalid(format!("Invalid arguments for {}: {}", tool, e)))
}

/// Reject absolute paths and `..` before anything touches the filesystem.
pub(crate) fn check_relative(path: &str) -> Result<String, ToolError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid("Path is empty"));
    }
    let p = Path::new(trimmed);
    if p.is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(ToolError::invalid(format!(
            "Absolute paths are not allowed: {}",
            trimmed
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ToolError::invalid(format!(
            "Parent traversal is not allowed: {}",
            trimmed
        )));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn parse_version(raw: Option<&str>) -> Result<Option<FileVersion>, ToolError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(token) => token.parse().map(Some).map_err(ToolError::invalid),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub fn context(dir: &TempDir) -> ToolContext {
        ToolContext::new(
            dir.path(),
            Arc::new(FileCoherenceManager::new()),
            Arc::new(DependencyAnalyzer::new()),
        )
    }

    pub async fn run(tool: &dyn Tool, ctx: &ToolContext, args: Value) -> ToolResult {
        match tool.validate(&args) {
            Ok(params) => tool.execute(params, ctx).await,
            Err(err) => ToolResult::failure(err),
        }
    }
}
