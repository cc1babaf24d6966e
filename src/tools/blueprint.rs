use super::{parse_args, Tool, ToolContext, ToolError, ToolParams, ToolResult};
use crate::analysis::scan_workspace;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

pub struct GetBlueprintTool;

#[derive(Deserialize)]
struct BlueprintArgs {}

#[async_trait]
impl Tool for GetBlueprintTool {
    fn name(&self) -> &'static str {
        "get_blueprint"
    }

    fn description(&self) -> &'static str {
        "Return the project blueprint: every analyzed source file with its imports, exports, \
         functions, classes and dependencies. Call it before generating code that spans \
         several files, and only reference names it lists."
    }

    fn parameter_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let _: BlueprintArgs = parse_args(self.name(), raw)?;
        Ok(ToolParams::GetBlueprint)
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::GetBlueprint = params else {
            return ToolResult::failure(ToolError::invalid(
                "get_blueprint received foreign parameters",
            ));
        };
        blueprint(ctx).await.into()
    }
}

async fn blueprint(ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    if ctx.analyzer.matrix(&ctx.workspace_root).is_empty() {
        ctx.report("Analyzing workspace...");
        let root = ctx.workspace_root.clone();
        let ignore = ctx.ignore.clone();
        let analyzer = ctx.analyzer.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            scan_workspace(&root, &ignore, &analyzer).metadata.len()
        })
        .await
        .map_err(|e| ToolError::execution(format!("Workspace scan failed: {}", e)))?;
        info!(files = scanned, "workspace analyzed for blueprint");
    }
    if ctx.cancel.is_cancelled() {
        return Err(ToolError::cancelled());
    }

    let matrix = ctx.analyzer.matrix(&ctx.workspace_root);
    let text = ctx.analyzer.generate_blueprint(&ctx.workspace_root);
    Ok(ToolResult::success(
        text,
        format!("Blueprint of {} source files", matrix.files.len()),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, run};
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scans_on_first_use() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("db.js"),
            "export function execute(sql) {}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("routes.js"),
            "import { execute } from './db';\nexport function handler() { execute('x'); }\n",
        )
        .unwrap();
        let ctx = context(&dir);

        let result = run(&GetBlueprintTool, &ctx, Value::Null).await;
        assert!(!result.is_error(), "{:?}", result.error);
        assert!(result.content.contains("## db.js"));
        assert!(result.content.contains("## routes.js"));
        assert!(result.content.contains("depends on: db.js"));
        assert_eq!(result.display_text, "Blueprint of 2 source files");
    }

    #[tokio::test]
    async fn repeated_calls_are_identical() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "import os\n\ndef main():\n    pass\n").unwrap();
        let ctx = context(&dir);

        let first = run(&GetBlueprintTool, &ctx, json!({})).await;
        let second = run(&GetBlueprintTool, &ctx, json!({})).await;
        assert_eq!(first.content, second.content);
    }
}
