use super::{parse_args, ShellParams, Tool, ToolContext, ToolError, ToolParams, ToolResult};
use crate::error::ErrorKind;
use crate::util::{truncate, truncate_output};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Commands that can reach outside the workspace or take the machine down.
const BLOCKED_PATTERNS: &[&str] = &[
    "sudo ",
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "mkfs",
    "dd if=",
    ":(){", // fork bomb
    "chmod -R 777 /",
    "chown -R",
    "> /dev/",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "wget | bash",
];

const MAX_TIMEOUT_SECS: u64 = 600;

pub struct RunShellTool;

#[derive(Deserialize)]
struct ShellArgs {
    command: String,
    timeout_secs: Option<u64>,
}

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &'static str {
        "run_shell"
    }

    fn description(&self) -> &'static str {
        "Run a shell command in the workspace root and return stdout, stderr and the exit \
         code. Commands are killed when they exceed the timeout. Prefer non-interactive \
         commands such as builds, tests and linters."
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line passed to the shell"},
                "timeout_secs": {"type": "integer", "description": "Wall-clock limit in seconds (default: configured shell timeout)"}
            },
            "required": ["command"]
        })
    }

    fn validate(&self, raw: &Value) -> Result<ToolParams, ToolError> {
        let args: ShellArgs = parse_args(self.name(), raw)?;
        let command = args.command.trim();
        if command.is_empty() {
            return Err(ToolError::invalid("command is empty"));
        }
        if let Some(pattern) = blocked_pattern(command) {
            return Err(ToolError::invalid(format!(
                "Command blocked for safety: contains '{}'. Commands must stay inside the workspace.",
                pattern
            )));
        }
        let timeout = match args.timeout_secs {
            Some(0) => return Err(ToolError::invalid("timeout_secs must be positive")),
            Some(secs) => Some(Duration::from_secs(secs.min(MAX_TIMEOUT_SECS))),
            None => None,
        };
        Ok(ToolParams::RunShell(ShellParams {
            command: command.to_string(),
            timeout,
        }))
    }

    async fn execute(&self, params: ToolParams, ctx: &ToolContext) -> ToolResult {
        let ToolParams::RunShell(params) = params else {
            return ToolResult::failure(ToolError::invalid("run_shell received foreign parameters"));
        };
        run_shell(params, ctx).await.into()
    }
}

fn blocked_pattern(command: &str) -> Option<&'static str> {
    let lower = command.to_lowercase();
    BLOCKED_PATTERNS
        .iter()
        .copied()
        .find(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

async fn run_shell(params: ShellParams, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    if !ctx.workspace_root.exists() {
        return Err(ToolError::execution(format!(
            "Workspace root does not exist: {}",
            ctx.workspace_root.display()
        )));
    }
    let timeout = params.timeout.unwrap_or(ctx.shell_timeout);
    ctx.report(format!("$ {}", truncate(&params.command, 120)));

    let child = shell_command(&params.command)
        .current_dir(&ctx.workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::execution(format!("Failed to start command: {}", e)))?;

    let start = Instant::now();
    // Dropping the wait future drops the child, and kill_on_drop reaps it.
    let output = tokio::select! {
        result = child.wait_with_output() => {
            result.map_err(|e| ToolError::execution(format!("Failed to wait for command: {}", e)))?
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(command = %params.command, secs = timeout.as_secs(), "shell command timed out");
            return Err(ToolError::new(
                ErrorKind::Timeout,
                format!("Command timed out after {}s and was killed", timeout.as_secs()),
            ));
        }
        _ = ctx.cancel.cancelled() => {
            return Err(ToolError::cancelled());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);
    debug!(
        command = %params.command,
        exit_code,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "shell command finished"
    );

    let mut result = String::new();
    if !stdout.is_empty() {
        result.push_str(&stdout);
    }
    if !stderr.is_empty() {
        if !result.is_empty() {
            result.push_str("\n--- stderr ---\n");
        }
        result.push_str(&stderr);
    }
    if result.is_empty() {
        result = format!("Command completed with exit code {}", exit_code);
    } else if exit_code != 0 {
        result.push_str(&format!("\n[exit code: {}]", exit_code));
    }

    Ok(ToolResult::success(
        truncate_output(result, ctx.max_output_bytes),
        format!("$ {} (exit {})", truncate(&params.command, 80), exit_code),
    ))
}
