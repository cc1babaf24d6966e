//! Breakpoints and pause/step control for running executions
//!
//! The engine calls [`BreakpointRegistry::check_breakpoint`] at each check
//! point (turn start, instruction, variable write, tool call). A hit pauses
//! the operation and records a [`BreakpointState`] snapshot; the engine then
//! parks in [`BreakpointRegistry::wait_while_paused`] until a host resumes it
//! with `continue_execution` or `step`.

use crate::engine::state::ToolCallInfo;
use crate::script::{Condition, Variables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointType {
    Turn,
    Instruction,
    Condition,
    Variable,
    ToolCall,
}

impl BreakpointType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "turn" => Some(Self::Turn),
            "instruction" => Some(Self::Instruction),
            "condition" => Some(Self::Condition),
            "variable" => Some(Self::Variable),
            "tool_call" | "tool" => Some(Self::ToolCall),
            _ => None,
        }
    }
}

impl fmt::Display for BreakpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BreakpointType::Turn => "turn",
            BreakpointType::Instruction => "instruction",
            BreakpointType::Condition => "condition",
            BreakpointType::Variable => "variable",
            BreakpointType::ToolCall => "tool_call",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakpoint {
    pub id: String,
    pub kind: BreakpointType,
    /// Turn label or index, `turn:instruction`, variable or tool name.
    /// `*` matches any location.
    pub location: String,
    pub condition: Option<Condition>,
    pub enabled: bool,
    pub hit_count: u64,
}

impl Breakpoint {
    fn matches(&self, kind: BreakpointType, location: &str, variables: &Variables) -> bool {
        self.enabled
            && self.kind == kind
            && (self.location == "*" || self.location == location)
            && self
                .condition
                .as_ref()
                .map(|c| c.evaluate(|name| variables.get(name).cloned()))
                .unwrap_or(true)
    }
}

/// What the engine knows at a check point.
pub struct CheckContext<'a> {
    pub turn_index: usize,
    pub variables: &'a Variables,
    pub tool_calls: &'a [ToolCallInfo],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakpointState {
    pub operation_id: String,
    /// `None` when the pause came from stepping.
    pub breakpoint_id: Option<String>,
    pub location: String,
    pub turn_index: usize,
    pub variables: Variables,
    pub tool_calls: Vec<ToolCallInfo>,
    pub hit_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("operation cancelled while paused")]
pub struct PauseCancelled;

#[derive(Default)]
struct OperationControl {
    paused: Option<BreakpointState>,
    stepping: bool,
}

#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: Mutex<Vec<Breakpoint>>,
    operations: Mutex<HashMap<String, OperationControl>>,
    resumed: Notify,
    next_id: AtomicU64,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_breakpoints<T>(&self, f: impl FnOnce(&mut Vec<Breakpoint>) -> T) -> T {
        let mut guard = self
            .breakpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn with_operations<T>(&self, f: impl FnOnce(&mut HashMap<String, OperationControl>) -> T) -> T {
        let mut guard = self
            .operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Returns the new breakpoint id.
    pub fn add(
        &self,
        kind: BreakpointType,
        location: impl Into<String>,
        condition: Option<&str>,
    ) -> Result<String, String> {
        let location = location.into();
        if location.trim().is_empty() {
            return Err("Breakpoint location is empty".to_string());
        }
        let condition = condition
            .filter(|c| !c.trim().is_empty())
            .map(Condition::parse)
            .transpose()?;
        let id = format!("bp-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.with_breakpoints(|bps| {
            bps.push(Breakpoint {
                id: id.clone(),
                kind,
                location: location.trim().to_string(),
                condition,
                enabled: true,
                hit_count: 0,
            })
        });
        Ok(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        self.with_breakpoints(|bps| {
            let before = bps.len();
            bps.retain(|bp| bp.id != id);
            bps.len() != before
        })
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        self.with_breakpoints(|bps| match bps.iter_mut().find(|bp| bp.id == id) {
            Some(bp) => {
                bp.enabled = enabled;
                true
            }
            None => false,
        })
    }

    pub fn enable(&self, id: &str) -> bool {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> bool {
        self.set_enabled(id, false)
    }

    pub fn list(&self) -> Vec<Breakpoint> {
        self.with_breakpoints(|bps| bps.clone())
    }

    /// Pause `operation_id` if stepping or if an enabled breakpoint matches.
    /// Returns the snapshot when the operation was paused.
    pub fn check_breakpoint(
        &self,
        operation_id: &str,
        kind: BreakpointType,
        location: &str,
        ctx: &CheckContext<'_>,
    ) -> Option<BreakpointState> {
        let stepping = self.with_operations(|ops| {
            ops.get(operation_id).map(|op| op.stepping).unwrap_or(false)
        });

        let breakpoint_id = if stepping {
            None
        } else {
            let hit = self.with_breakpoints(|bps| {
                bps.iter_mut()
                    .find(|bp| bp.matches(kind, location, ctx.variables))
                    .map(|bp| {
                        bp.hit_count += 1;
                        bp.id.clone()
                    })
            });
            Some(hit?)
        };

        let state = BreakpointState {
            operation_id: operation_id.to_string(),
            breakpoint_id,
            location: format!("{}:{}", kind, location),
            turn_index: ctx.turn_index,
            variables: ctx.variables.clone(),
            tool_calls: ctx.tool_calls.to_vec(),
            hit_at: Utc::now(),
        };
        info!(
            operation = operation_id,
            location = %state.location,
            breakpoint = state.breakpoint_id.as_deref().unwrap_or("step"),
            "execution paused"
        );
        self.with_operations(|ops| {
            let op = ops.entry(operation_id.to_string()).or_default();
            op.stepping = false;
            op.paused = Some(state.clone());
        });
        Some(state)
    }

    pub fn is_paused(&self, operation_id: &str) -> bool {
        self.paused_state(operation_id).is_some()
    }

    pub fn paused_state(&self, operation_id: &str) -> Option<BreakpointState> {
        self.with_operations(|ops| ops.get(operation_id).and_then(|op| op.paused.clone()))
    }

    /// Resume a paused operation. Returns false when it was not paused.
    pub fn continue_execution(&self, operation_id: &str) -> bool {
        self.resume(operation_id, false)
    }

    /// Resume and pause again at the next check point.
    pub fn step(&self, operation_id: &str) -> bool {
        self.resume(operation_id, true)
    }

    fn resume(&self, operation_id: &str, stepping: bool) -> bool {
        let resumed = self.with_operations(|ops| match ops.get_mut(operation_id) {
            Some(op) if op.paused.is_some() => {
                op.paused = None;
                op.stepping = stepping;
                true
            }
            _ => false,
        });
        if resumed {
            self.resumed.notify_waiters();
        }
        resumed
    }

    /// Park until the operation is no longer paused.
    pub async fn wait_while_paused(
        &self,
        operation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PauseCancelled> {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            // Register before checking so a resume in between is not lost.
            notified.as_mut().enable();
            if !self.is_paused(operation_id) {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(PauseCancelled),
            }
        }
    }

    /// Drop pause and step state once an operation ends.
    pub fn clear_operation(&self, operation_id: &str) {
        let removed = self.with_operations(|ops| ops.remove(operation_id));
        if removed.is_some_and(|op| op.paused.is_some()) {
            self.resumed.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ctx(variables: &Variables) -> CheckContext<'_> {
        CheckContext {
            turn_index: 0,
            variables,
            tool_calls: &[],
        }
    }

    #[test]
    fn matches_by_type_location_and_condition() {
        let registry = BreakpointRegistry::new();
        let id = registry
            .add(BreakpointType::Turn, "review", Some("attempts >= 2"))
            .unwrap();

        let low = vars(&[("attempts", "1")]);
        assert!(registry
            .check_breakpoint("op", BreakpointType::Turn, "review", &ctx(&low))
            .is_none());
        assert!(registry
            .check_breakpoint("op", BreakpointType::ToolCall, "review", &ctx(&low))
            .is_none());

        let high = vars(&[("attempts", "10")]);
        let state = registry
            .check_breakpoint("op", BreakpointType::Turn, "review", &ctx(&high))
            .unwrap();
        assert_eq!(state.breakpoint_id.as_deref(), Some(id.as_str()));
        assert_eq!(state.variables["attempts"], "10");
        assert!(registry.is_paused("op"));
        assert_eq!(registry.list()[0].hit_count, 1);
    }

    #[test]
    fn wildcard_and_disable() {
        let registry = BreakpointRegistry::new();
        let id = registry.add(BreakpointType::ToolCall, "*", None).unwrap();
        let empty = Variables::new();

        assert!(registry.disable(&id));
        assert!(registry
            .check_breakpoint("op", BreakpointType::ToolCall, "run_shell", &ctx(&empty))
            .is_none());
        assert!(registry.enable(&id));
        assert!(registry
            .check_breakpoint("op", BreakpointType::ToolCall, "run_shell", &ctx(&empty))
            .is_some());
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
    }

    #[test]
    fn invalid_condition_is_rejected() {
        let registry = BreakpointRegistry::new();
        assert!(registry
            .add(BreakpointType::Variable, "x", Some("== 3"))
            .is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn step_pauses_at_next_check_point() {
        let registry = BreakpointRegistry::new();
        registry.add(BreakpointType::Turn, "0", None).unwrap();
        let empty = Variables::new();

        registry.check_breakpoint("op", BreakpointType::Turn, "0", &ctx(&empty));
        assert!(registry.step("op"));
        let state = registry
            .check_breakpoint("op", BreakpointType::Instruction, "0:echo", &ctx(&empty))
            .unwrap();
        assert!(state.breakpoint_id.is_none());

        assert!(registry.continue_execution("op"));
        assert!(registry
            .check_breakpoint("op", BreakpointType::Instruction, "0:echo", &ctx(&empty))
            .is_none());
    }

    #[tokio::test]
    async fn waiting_resumes_on_continue() {
        let registry = Arc::new(BreakpointRegistry::new());
        registry.add(BreakpointType::Turn, "*", None).unwrap();
        let empty = Variables::new();
        registry.check_breakpoint("op", BreakpointType::Turn, "0", &ctx(&empty));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .wait_while_paused("op", &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        registry.continue_execution("op");
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn waiting_stops_on_cancel() {
        let registry = BreakpointRegistry::new();
        registry.add(BreakpointType::Turn, "*", None).unwrap();
        let empty = Variables::new();
        registry.check_breakpoint("op", BreakpointType::Turn, "0", &ctx(&empty));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            registry.wait_while_paused("op", &cancel).await,
            Err(PauseCancelled)
        );
        registry.clear_operation("op");
        assert!(registry.paused_state("op").is_none());
    }
}
