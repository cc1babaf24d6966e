//! Tool-call dispatch
//!
//! Calls from one model response are validated up front, grouped into
//! batches of calls whose footprints do not overlap, and each batch runs
//! concurrently. Batches never reorder calls, so a later call that touches
//! an earlier call's path always sees its effect. Results come back in issue
//! order regardless of completion order.

use crate::error::ErrorKind;
use crate::llm::FunctionCall;
use crate::tools::{Tool, ToolAccess, ToolContext, ToolError, ToolParams, ToolRegistry, ToolResult};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PreparedCall {
    pub call: FunctionCall,
    prepared: Result<(Arc<dyn Tool>, ToolParams), ToolError>,
}

impl PreparedCall {
    /// `None` for calls that failed validation; they never run.
    pub fn access(&self) -> Option<ToolAccess> {
        self.prepared.as_ref().ok().map(|(_, params)| params.access())
    }
}

/// Resolve the tool by name and type its arguments.
pub fn prepare(registry: &ToolRegistry, call: FunctionCall, tools_enabled: bool) -> PreparedCall {
    let prepared = if !tools_enabled {
        Err(ToolError::invalid("Tools are disabled for this script"))
    } else {
        match registry.get(&call.name) {
            Some(tool) => tool.validate(&call.args).map(|params| (tool, params)),
            None => Err(ToolError::new(
                ErrorKind::InvalidParameters,
                format!(
                    "Unknown tool '{}'. Available tools: {}",
                    call.name,
                    registry.names().join(", ")
                ),
            )),
        }
    };
    if let Err(err) = &prepared {
        debug!(tool = %call.name, error = %err, "tool call rejected before execution");
    }
    PreparedCall { call, prepared }
}

/// Split calls (by index) into consecutive batches with no conflicting
/// footprints inside a batch.
pub fn plan_batches(calls: &[PreparedCall]) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<(usize, ToolAccess)> = Vec::new();

    for (index, call) in calls.iter().enumerate() {
        let Some(access) = call.access() else {
            // Rejected calls have no footprint and ride along.
            match batches.last_mut() {
                Some(last) if current.is_empty() => last.push(index),
                _ => current.push((index, ToolAccess::Read(Vec::new()))),
            }
            continue;
        };
        if current.iter().any(|(_, other)| other.conflicts_with(&access)) {
            batches.push(current.drain(..).map(|(i, _)| i).collect());
        }
        current.push((index, access));
    }
    if !current.is_empty() {
        batches.push(current.into_iter().map(|(i, _)| i).collect());
    }
    for batch in &mut batches {
        batch.sort_unstable();
    }
    batches
}

/// Execute every call and return exactly one result per call, in order.
pub async fn execute_calls(
    calls: Vec<PreparedCall>,
    ctx: &ToolContext,
    parallel: bool,
) -> Vec<ToolResult> {
    let batches = if parallel {
        plan_batches(&calls)
    } else {
        (0..calls.len()).map(|i| vec![i]).collect()
    };
    debug!(calls = calls.len(), batches = batches.len(), "dispatching tool calls");

    let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
    let mut pending: Vec<Option<PreparedCall>> = calls.into_iter().map(Some).collect();

    for batch in batches {
        let mut handles = Vec::with_capacity(batch.len());
        for index in batch {
            let Some(call) = pending[index].take() else {
                continue;
            };
            match call.prepared {
                Err(err) => slots[index] = Some(ToolResult::failure(err)),
                Ok(_) if ctx.cancel.is_cancelled() => {
                    slots[index] = Some(ToolResult::failure(ToolError::cancelled()))
                }
                Ok((tool, params)) => {
                    let ctx = ctx.clone();
                    handles.push((
                        index,
                        tokio::spawn(async move { tool.execute(params, &ctx).await }),
                    ));
                }
            }
        }

        let (indices, tasks): (Vec<usize>, Vec<_>) = handles.into_iter().unzip();
        for (index, joined) in indices.into_iter().zip(join_all(tasks).await) {
            slots[index] = Some(joined.unwrap_or_else(|e| {
                warn!(error = %e, "tool task failed");
                ToolResult::failure(ToolError::execution(format!("Tool task failed: {}", e)))
            }));
        }
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| ToolResult::failure(ToolError::execution("Tool call was not run")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::tempdir;

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    fn prepare_all(calls: Vec<FunctionCall>) -> Vec<PreparedCall> {
        let registry = ToolRegistry::with_builtin_tools();
        calls
            .into_iter()
            .map(|c| prepare(&registry, c, true))
            .collect()
    }

    #[test]
    fn independent_calls_share_a_batch() {
        let calls = prepare_all(vec![
            call("1", "read_file", json!({"path": "a.js"})),
            call("2", "read_file", json!({"path": "b.js"})),
            call("3", "write_file", json!({"path": "a.js", "content": "x"})),
            call("4", "run_shell", json!({"command": "ls"})),
            call("5", "read_file", json!({"path": "c.js"})),
        ]);
        assert_eq!(plan_batches(&calls), vec![vec![0, 1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn rejected_calls_do_not_split_batches() {
        let calls = prepare_all(vec![
            call("1", "read_file", json!({"path": "a.js"})),
            call("2", "no_such_tool", json!({})),
            call("3", "read_file", json!({"path": "b.js"})),
        ]);
        assert_eq!(plan_batches(&calls), vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn results_follow_issue_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        fs::write(dir.path().join("b.txt"), "beta\n").unwrap();
        let ctx = context(&dir);

        let calls = prepare_all(vec![
            call("1", "read_file", json!({"path": "a.txt"})),
            call("2", "missing_tool", json!({})),
            call("3", "read_file", json!({"path": "b.txt"})),
            call("4", "read_file", json!({"path": "nope.txt"})),
        ]);
        let results = execute_calls(calls, &ctx, true).await;

        assert_eq!(results.len(), 4);
        assert!(results[0].content.contains("alpha"));
        assert_eq!(results[1].error.as_ref().unwrap().kind, ErrorKind::InvalidParameters);
        assert!(results[2].content.contains("beta"));
        assert_eq!(results[3].error.as_ref().unwrap().kind, ErrorKind::FileNotFound);
    }

    #[tokio::test]
    async fn write_then_read_sees_the_write() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir);
        let calls = prepare_all(vec![
            call("1", "write_file", json!({"path": "new.txt", "content": "fresh\n"})),
            call("2", "read_file", json!({"path": "new.txt"})),
        ]);
        let results = execute_calls(calls, &ctx, true).await;
        assert!(!results[0].is_error(), "{:?}", results[0].error);
        assert!(results[1].content.contains("fresh"));
    }

    #[test]
    fn disabled_tools_reject_every_call() {
        let registry = ToolRegistry::with_builtin_tools();
        let prepared = prepare(&registry, call("1", "read_file", json!({"path": "a"})), false);
        assert!(prepared.access().is_none());
    }
}
