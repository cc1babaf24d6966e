//! Live view of in-flight executions.

use crate::script::Variables;
use crate::tools::ToolResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub turn_index: usize,
    /// `None` while the call is running.
    pub result: Option<ToolResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    pub operation_id: String,
    pub variables: Variables,
    pub tool_calls: Vec<ToolCallInfo>,
    pub current_turn: usize,
    pub total_turns: usize,
    pub started_at: DateTime<Utc>,
}

/// Process-wide registry of running executions, keyed by operation id.
#[derive(Default)]
pub struct ExecutionTracker {
    states: RwLock<HashMap<String, ExecutionState>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, ExecutionState>) -> T) -> T {
        let mut states = self
            .states
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut states)
    }

    fn update(&self, operation_id: &str, f: impl FnOnce(&mut ExecutionState)) {
        self.write(|states| {
            if let Some(state) = states.get_mut(operation_id) {
                f(state);
            }
        });
    }

    pub fn register(&self, operation_id: &str, total_turns: usize, variables: Variables) {
        let state = ExecutionState {
            operation_id: operation_id.to_string(),
            variables,
            tool_calls: Vec::new(),
            current_turn: 0,
            total_turns,
            started_at: Utc::now(),
        };
        self.write(|states| states.insert(operation_id.to_string(), state));
    }

    pub fn set_turn(&self, operation_id: &str, turn: usize) {
        self.update(operation_id, |state| state.current_turn = turn);
    }

    pub fn set_variables(&self, operation_id: &str, variables: &Variables) {
        self.update(operation_id, |state| state.variables = variables.clone());
    }

    pub fn start_tool_call(&self, operation_id: &str, id: &str, name: &str, args: &Value, turn_index: usize) {
        let info = ToolCallInfo {
            id: id.to_string(),
            name: name.to_string(),
            args: args.clone(),
            turn_index,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.update(operation_id, |state| state.tool_calls.push(info));
    }

    /// Attach a result to the most recent running call with this id.
    pub fn finish_tool_call(&self, operation_id: &str, id: &str, result: &ToolResult) {
        self.update(operation_id, |state| {
            if let Some(info) = state
                .tool_calls
                .iter_mut()
                .rev()
                .find(|info| info.id == id && info.result.is_none())
            {
                info.result = Some(result.clone());
                info.finished_at = Some(Utc::now());
            }
        });
    }

    pub fn get(&self, operation_id: &str) -> Option<ExecutionState> {
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get(operation_id).cloned()
    }

    pub fn active(&self) -> Vec<String> {
        let states = self
            .states
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<String> = states.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, operation_id: &str) -> Option<ExecutionState> {
        self.write(|states| states.remove(operation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracks_tool_calls_until_removed() {
        let tracker = ExecutionTracker::new();
        tracker.register("op", 2, Variables::new());
        tracker.set_turn("op", 1);
        tracker.start_tool_call("op", "call_0", "read_file", &json!({"path": "a"}), 1);

        let running = tracker.get("op").unwrap();
        assert_eq!(running.current_turn, 1);
        assert!(running.tool_calls[0].result.is_none());

        tracker.finish_tool_call("op", "call_0", &ToolResult::success("x", "x"));
        let done = tracker.get("op").unwrap();
        assert!(done.tool_calls[0].finished_at.is_some());
        assert_eq!(tracker.active(), vec!["op".to_string()]);

        assert!(tracker.remove("op").is_some());
        assert!(tracker.get("op").is_none());
    }

    #[test]
    fn updates_to_unknown_operations_are_ignored() {
        let tracker = ExecutionTracker::new();
        tracker.set_turn("ghost", 3);
        assert!(tracker.active().is_empty());
    }
}
