use super::{
    check_relative, parse_args, SearchParams, Tool, ToolContext, ToolError, ToolParams,
    ToolResult,
};
use crate::analysis::IgnoreList;
use crate::error::ErrorKind;
use crate::util::{path_key, truncate, truncate_output};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const DEFAULT_MAX_RESULTS: usize = 50;
const MAX_RESULTS_CAP: usize = 200;
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;
const MAX_LINE_CHARS: usize = 200;

pub struct SearchFilesTool;

#[derive(Deserialize)]
struct SearchArgs {
    pattern: String,
    path: Option<String>,
    max_results: Option<usize>,
    #[serde(default)]
    case_insensitive: bool,
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn description(&self) -> &'static str {
        "Search file contents with a regular expression. Returns path:line: text for each \
         match. Use it to find where to look before reading."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regex pattern"},
                "path": {"type": "string", "description": "File or directory (default: workspace root)"},
                "max_results": {"type": "integer", "description": "Maximum matches (default: 50, max: 200)"},
                "case_insensitive": {"type": "boolean", "description": "Ignore case (default: false)"}
            },
            "required": ["pattern"]
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: SearchArgs = parse_args(self.name(), raw)?;
        if args.pattern.is_empty() {
            return Err(ToolError::invalid("pattern is empty"));
        }
        let pattern = RegexBuilder::new(&args.pattern)
            .case_insensitive(args.case_insensitive)
            .size_limit(1 << 20)
            .build()
            .map_err(|e| ToolError::invalid(format!("Invalid regex: {}", e)))?;
        let path = match args.path.as_deref().map(str::trim) {
            None | Some("") | Some(".") | Some("./") => ".".to_string(),
            Some(p) => check_relative(p)?,
        };
        Ok(ToolParams::SearchFiles(SearchParams {
            pattern,
            path,
            max_results: args
                .max_results
                .unwrap_or(DEFAULT_MAX_RESULTS)
                .clamp(1, MAX_RESULTS_CAP),
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::SearchFiles(params) = params else {
            return ToolResult::failure(ToolError::invalid(
                "search_files received foreign parameters",
            ));
        };
        search(params, ctx).await.into()
    }
}

async fn search(params: SearchParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let resolved = ctx.resolve(&params.path)?;
    if !resolved.absolute.exists() {
        return Err(ToolError::new(
            ErrorKind::FileNotFound,
            format!("Path not found: {}", params.path),
        ));
    }

    let root = ctx.workspace_root.canonicalize().map_err(|e| {
        ToolError::execution(format!("Failed to resolve workspace root: {}", e))
    })?;
    let target = resolved.absolute.clone();
    let ignore = ctx.ignore.clone();
    let cancel = ctx.cancel.clone();
    let pattern = params.pattern.clone();
    let limit = params.max_results;

    let hits = tokio::task::spawn_blocking(move || {
        scan(&root, &target, &ignore, &pattern, limit, &cancel)
    })
    .await
    .map_err(|e| ToolError::execution(format!("Search failed: {}", e)))?;

    let hits = match hits {
        Some(hits) => hits,
        None => return Err(ToolError::cancelled()),
    };
    if hits.lines.is_empty() {
        return Ok(ToolResult::success(
            format!("No matches found for pattern: {}", params.pattern),
            "No matches".to_string(),
        ));
    }

    let mut output = hits.lines.join("\n");
    if hits.truncated {
        output.push_str(&format!(
            "\n... (stopped after {} matches; narrow the pattern or path)",
            limit
        ));
    }
    Ok(ToolResult::success(
        truncate_output(output, ctx.max_output_bytes),
        format!(
            "{} match{} in {} file{}",
            hits.lines.len(),
            if hits.lines.len() == 1 { "" } else { "es" },
            hits.files,
            if hits.files == 1 { "" } else { "s" }
        ),
    ))
}

struct Hits {
    lines: Vec<String>,
    files: usize,
    truncated: bool,
}

/// `None` when cancelled.
fn scan(
    root: &Path,
    target: &Path,
    ignore: &IgnoreList,
    pattern: &Regex,
    limit: usize,
    cancel: &CancellationToken,
) -> Option<Hits> {
    let mut hits = Hits {
        lines: Vec::new(),
        files: 0,
        truncated: false,
    };

    let walker = WalkDir::new(target)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !ignore.is_ignored(relative)
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if cancel.is_cancelled() {
            return None;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .metadata()
            .map(|m| m.len() > MAX_SEARCH_FILE_BYTES)
            .unwrap_or(true)
        {
            continue;
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let key = path_key(relative);
        let mut matched_file = false;
        for (idx, line) in content.lines().enumerate() {
            if !pattern.is_match(line) {
                continue;
            }
            if hits.lines.len() >= limit {
                hits.truncated = true;
                return Some(hits);
            }
            matched_file = true;
            hits.lines.push(format!(
                "{}:{}: {}",
                key,
                idx + 1,
                truncate(line.trim_end(), MAX_LINE_CHARS)
            ));
        }
        if matched_file {
            hits.files += 1;
        }
    }
    Some(hits)
}
