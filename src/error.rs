//! Shared failure taxonomy
//!
//! Every component has its own `thiserror` enum, but they all map onto
//! [`ErrorKind`]. Retry and surfacing decisions are made from it by
//! [`crate::classify::ErrorClassifier`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse failure category shared by tools, the API layer and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimited,
    KeysExhausted,
    MalformedResponse,
    ToolExecution,
    FileNotFound,
    InvalidParameters,
    Cancelled,
    Timeout,
    ScriptStructure,
    /// Turn or iteration budget exhausted before a final answer.
    Incomplete,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network error",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::KeysExhausted => "API keys exhausted",
            ErrorKind::MalformedResponse => "malformed response",
            ErrorKind::ToolExecution => "tool execution error",
            ErrorKind::FileNotFound => "file not found",
            ErrorKind::InvalidParameters => "invalid parameters",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ScriptStructure => "script structure error",
            ErrorKind::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
