use super::{
    check_relative, parse_args, parse_version, ListDirectoryParams, ReadFileParams, Tool,
    ToolContext, ToolError, ToolParams, ToolResult, WriteFileParams,
};
use crate::analysis::{analyze, IgnoreList, Language};
use crate::coherence::Precondition;
use crate::error::ErrorKind;
use crate::util::{path_key, truncate_output};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;

const DEFAULT_TREE_DEPTH: usize = 2;
const MAX_TREE_DEPTH: usize = 6;
const MAX_TREE_ENTRIES: usize = 500;

// ═══════════════════════════════════════════════════════════════════════════
//  READ_FILE
// ═══════════════════════════════════════════════════════════════════════════

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    start_line: Option<usize>,
    end_line: Option<usize>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a file, optionally a 1-indexed inclusive line range. Lines are prefixed with \
         their number and '│' (not part of the file). Returns the version token to pass as \
         expected_version when writing or editing."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "start_line": {"type": "integer", "description": "First line (1-indexed)"},
                "end_line": {"type": "integer", "description": "Last line (inclusive)"}
            },
            "required": ["path"]
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: ReadFileArgs = parse_args(self.name(), raw)?;
        if args.start_line == Some(0) {
            return Err(ToolError::invalid("start_line is 1-indexed"));
        }
        if let (Some(start), Some(end)) = (args.start_line, args.end_line) {
            if end < start {
                return Err(ToolError::invalid("end_line must be >= start_line"));
            }
        }
        Ok(ToolParams::ReadFile(ReadFileParams {
            path: check_relative(&args.path)?,
            start_line: args.start_line,
            end_line: args.end_line,
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::ReadFile(params) = params else {
            return ToolResult::failure(ToolError::invalid("read_file received foreign parameters"));
        };
        read_file(params, ctx).await.into()
    }
}

async fn read_file(params: ReadFileParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let resolved = ctx.resolve(&params.path)?;
    if resolved.absolute.is_dir() {
        return Err(ToolError::invalid(format!(
            "{} is a directory; use list_directory",
            params.path
        )));
    }
    let (content, version) = ctx.coherence.read_with_version(&resolved.absolute).await?;

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = params.start_line.unwrap_or(1).saturating_sub(1);
    let end = params.end_line.unwrap_or(total).min(total);
    if total > 0 && start >= total {
        return Err(ToolError::invalid(format!(
            "start_line {} exceeds file length ({})",
            start + 1,
            total
        )));
    }

    let mut output = format!(
        "{} (version {}, {} lines)\n",
        path_key(&resolved.relative),
        version,
        total
    );
    if start > 0 {
        output.push_str(&format!("... (lines 1-{} above)\n", start));
    }
    for (i, line) in lines[start.min(total)..end].iter().enumerate() {
        output.push_str(&format!("{:>4}│ {}\n", start + i + 1, line));
    }
    if end < total {
        output.push_str(&format!("... ({} more lines below)\n", total - end));
    }

    let display = if params.start_line.is_some() || params.end_line.is_some() {
        format!("Read {} lines {}-{}", params.path, start + 1, end)
    } else {
        format!("Read {} ({} lines)", params.path, total)
    };
    Ok(ToolResult::success(
        truncate_output(output, ctx.max_output_bytes),
        display,
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
//  WRITE_FILE
// ═══════════════════════════════════════════════════════════════════════════

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
    expected_version: Option<String>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Create a file, or replace an existing file completely. Replacing requires the \
         expected_version returned by read_file; omit it only for new files."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "content": {"type": "string", "description": "Full new file content"},
                "expected_version": {
                    "type": "string",
                    "description": "Version token from read_file. Omit when creating a new file."
                }
            },
            "required": ["path", "content"]
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: WriteFileArgs = parse_args(self.name(), raw)?;
        Ok(ToolParams::WriteFile(WriteFileParams {
            path: check_relative(&args.path)?,
            content: args.content,
            expected_version: parse_version(args.expected_version.as_deref())?,
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::WriteFile(params) = params else {
            return ToolResult::failure(ToolError::invalid("write_file received foreign parameters"));
        };
        write_file(params, ctx).await.into()
    }
}

async fn write_file(params: WriteFileParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let resolved = ctx.resolve(&params.path)?;
    if resolved.absolute.is_dir() {
        return Err(ToolError::invalid(format!("{} is a directory", params.path)));
    }
    let precondition = Precondition::from(params.expected_version);
    let outcome = ctx
        .coherence
        .write_versioned(&resolved.absolute, &params.content, precondition)
        .await?;

    let key = path_key(&resolved.relative);
    refresh_metadata(ctx, &key, &params.content);

    let lines = params.content.lines().count();
    let mut content = format!(
        "{} {} ({} lines). New version: {}",
        if outcome.created { "Created" } else { "Updated" },
        key,
        lines,
        outcome.version
    );
    content.push_str(&dependents_note(ctx, &key));
    let display = match &outcome.patch {
        Some(patch) if !patch.is_empty() => patch.clone(),
        Some(_) => format!("{} unchanged", key),
        None => format!("Created {} ({} lines)", key, lines),
    };
    Ok(ToolResult::success(content, display))
}

/// Keep the dependency matrix in step with files the model writes.
pub(crate) fn refresh_metadata(ctx: &ToolContext, key: &str, content: &str) {
    if Language::from_path(Path::new(key)).is_supported() {
        let metadata = analyze(key, content);
        ctx.analyzer.update_matrix(&ctx.workspace_root, metadata);
        debug!(path = key, "dependency matrix updated");
    }
}

/// Files importing `key`, for the model to re-check after a change.
pub(crate) fn dependents_note(ctx: &ToolContext, key: &str) -> String {
    let dependents = ctx.analyzer.dependents_of(&ctx.workspace_root, key);
    if dependents.is_empty() {
        return String::new();
    }
    format!(
        "\nImported by: {}. Check these still match its exports.",
        dependents.join(", ")
    )
}

// ═══════════════════════════════════════════════════════════════════════════
//  LIST_DIRECTORY
// ═══════════════════════════════════════════════════════════════════════════

pub struct ListDirectoryTool;

#[derive(Deserialize)]
struct ListDirectoryArgs {
    path: Option<String>,
    depth: Option<usize>,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List the directory tree. Start here to understand the project layout. Ignored \
         directories (build output, dependencies, VCS metadata) are skipped."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory (default: workspace root)"},
                "depth": {"type": "integer", "description": "Max depth (default: 2, max: 6)"}
            }
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: ListDirectoryArgs = parse_args(self.name(), raw)?;
        let path = match args.path.as_deref().map(str::trim) {
            None | Some("") | Some(".") | Some("./") => ".".to_string(),
            Some(p) => check_relative(p)?,
        };
        Ok(ToolParams::ListDirectory(ListDirectoryParams {
            path,
            depth: args.depth.unwrap_or(DEFAULT_TREE_DEPTH).clamp(1, MAX_TREE_DEPTH),
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::ListDirectory(params) = params else {
            return ToolResult::failure(ToolError::invalid(
                "list_directory received foreign parameters",
            ));
        };
        list_directory(params, ctx).await.into()
    }
}

async fn list_directory(
    params: ListDirectoryParams,
    ctx: &ToolContext,
) -> Result<ToolResult, ToolError> {
    let resolved = ctx.resolve(&params.path)?;
    if !resolved.absolute.exists() {
        return Err(ToolError::new(
            ErrorKind::FileNotFound,
            format!("Path not found: {}", params.path),
        ));
    }
    if !resolved.absolute.is_dir() {
        return Err(ToolError::invalid(format!("{} is not a directory", params.path)));
    }

    let absolute = resolved.absolute.clone();
    let relative = resolved.relative.clone();
    let ignore = ctx.ignore.clone();
    let depth = params.depth;
    let (tree, entries) = tokio::task::spawn_blocking(move || {
        let mut out = String::new();
        let mut entries = 0usize;
        let label = if relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            path_key(&relative)
        };
        out.push_str(&format!("{}/\n", label));
        build_tree(&absolute, &relative, &ignore, "", depth, &mut out, &mut entries);
        (out, entries)
    })
    .await
    .map_err(|e| ToolError::execution(format!("Directory listing failed: {}", e)))?;

    Ok(ToolResult::success(
        truncate_output(tree, ctx.max_output_bytes),
        format!("Listed {} ({} entries)", params.path, entries),
    ))
}

fn build_tree(
    dir: &Path,
    relative: &Path,
    ignore: &IgnoreList,
    prefix: &str,
    depth_left: usize,
    out: &mut String,
    entries: &mut usize,
) {
    if depth_left == 0 {
        return;
    }
    let mut children: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(_) => return,
    };
    children.sort_by_key(|e| e.file_name());
    let children: Vec<_> = children
        .into_iter()
        .filter(|e| !ignore.is_ignored(&relative.join(e.file_name())))
        .collect();

    let count = children.len();
    for (i, child) in children.into_iter().enumerate() {
        if *entries >= MAX_TREE_ENTRIES {
            out.push_str(&format!("{}... (listing truncated)\n", prefix));
            return;
        }
        *entries += 1;
        let is_last = i + 1 == count;
        let connector = if is_last { "└── " } else { "├── " };
        let name = child.file_name().to_string_lossy().into_owned();
        let is_dir = child.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            out.push_str(&format!("{}{}{}/\n", prefix, connector, name));
            let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
            build_tree(
                &child.path(),
                &relative.join(&name),
                ignore,
                &child_prefix,
                depth_left - 1,
                out,
                entries,
            );
        } else {
            out.push_str(&format!("{}{}{}\n", prefix, connector, name));
        }
    }
}
