use super::fs::{dependents_note, refresh_metadata};
use super::{
    check_relative, parse_args, parse_version, EditFileParams, Tool, ToolContext, ToolError,
    ToolParams, ToolResult,
};
use crate::coherence::{unified_patch, CoherenceError, Precondition};
use crate::fuzzy::{find_best_match_with, FuzzyError, FuzzyMatch};
use crate::util::{path_key, truncate};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;

pub struct EditFileTool;

#[derive(Deserialize)]
struct EditFileArgs {
    path: String,
    old_text: String,
    new_text: String,
    line_hint: Option<usize>,
    expected_version: Option<String>,
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn description(&self) -> &'static str {
        "Replace old_text with new_text in a file. old_text should be copied from read_file \
         output without the line-number prefix; small whitespace or typo differences are \
         tolerated. Pass line_hint when you know roughly where the text is."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "old_text": {"type": "string", "description": "Text to replace"},
                "new_text": {"type": "string", "description": "Replacement text"},
                "line_hint": {"type": "integer", "description": "Approximate 1-indexed line of old_text"},
                "expected_version": {"type": "string", "description": "Version token from read_file"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: EditFileArgs = parse_args(self.name(), raw)?;
        if args.old_text.is_empty() {
            return Err(ToolError::invalid(
                "old_text is empty; use write_file to create or replace whole files",
            ));
        }
        if args.old_text == args.new_text {
            return Err(ToolError::invalid("old_text and new_text are identical"));
        }
        Ok(ToolParams::EditFile(EditFileParams {
            path: check_relative(&args.path)?,
            old_text: args.old_text,
            new_text: args.new_text,
            line_hint: args.line_hint.filter(|l| *l > 0),
            expected_version: parse_version(args.expected_version.as_deref())?,
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::EditFile(params) = params else {
            return ToolResult::failure(ToolError::invalid("edit_file received foreign parameters"));
        };
        edit_file(params, ctx).await.into()
    }
}

struct Applied {
    found: FuzzyMatch,
    exact: bool,
    patch: String,
    version: String,
    updated: String,
}

async fn edit_file(params: EditFileParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let resolved = ctx.resolve(&params.path)?;
    let key = path_key(&resolved.relative);
    let options = ctx.fuzzy;
    let display_path = PathBuf::from(&key);

    // Read, match and write under one lock so nothing can slip in between.
    let applied = ctx
        .coherence
        .with_file_lock(&resolved.absolute, |file| async move {
            let (content, version) = file.read_with_version().await?;
            if let Some(expected) = params.expected_version {
                if expected != version {
                    return Err(ToolError::from(CoherenceError::VersionConflict {
                        path: file.path().to_path_buf(),
                        expected: expected.to_string(),
                        actual: version.to_string(),
                    }));
                }
            }

            let found = match find_best_match_with(
                &content,
                &params.old_text,
                params.line_hint,
                &options,
            ) {
                Ok(Some(found)) => found,
                Ok(None) => {
                    return Err(ToolError::execution(format!(
                        "old_text not found in {} (no region reached the similarity threshold). \
                         Read the file again and copy the exact text.",
                        params.path
                    )))
                }
                Err(FuzzyError::EmptyTarget) => {
                    return Err(ToolError::invalid("old_text is empty"));
                }
            };

            let mut updated = String::with_capacity(content.len() + params.new_text.len());
            updated.push_str(&content[..found.start]);
            updated.push_str(&params.new_text);
            updated.push_str(&content[found.end..]);

            let outcome = file
                .write_checked(&updated, Precondition::Matches(version))
                .await?;
            Ok::<_, ToolError>(Applied {
                patch: unified_patch(&display_path, &content, &updated),
                exact: found.matched_text == params.old_text,
                version: outcome.version.to_string(),
                found,
                updated,
            })
        })
        .await??;

    refresh_metadata(ctx, &key, &applied.updated);
    debug!(
        path = %key,
        similarity = applied.found.similarity,
        "edit applied"
    );

    let how = if applied.exact {
        "exact match".to_string()
    } else {
        format!(
            "fuzzy match {:.0}%, matched: {}",
            applied.found.similarity * 100.0,
            truncate(applied.found.matched_text.trim(), 120)
        )
    };
    let mut content = format!(
        "Edited {} lines {}-{} ({}). New version: {}",
        key, applied.found.start_line, applied.found.end_line, how, applied.version
    );
    content.push_str(&dependents_note(ctx, &key));
    Ok(ToolResult::success(content, applied.patch))
}
