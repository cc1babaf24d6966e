use crate::error::ErrorKind;
use crate::script::Variables;
use crate::tools::ToolResult;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a host learns about a run, in order, through one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Answer text or `$echo` output.
    Chunk { text: String },
    ToolCall { id: String, name: String, args: Value },
    /// Progress line from a running tool.
    Progress { message: String },
    ToolResult {
        id: String,
        name: String,
        result: ToolResult,
    },
    Done {
        final_content: String,
        variables: Variables,
    },
    Error {
        kind: ErrorKind,
        message: String,
        hint: Option<String>,
        retry_after: Option<Duration>,
    },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done { .. } | AgentEvent::Error { .. })
    }
}

/// Sending half, owned by the running execution.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSink {
    /// A host that dropped its stream no longer cares; sends are best-effort.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn chunk(&self, text: impl Into<String>) {
        self.emit(AgentEvent::Chunk { text: text.into() });
    }
}

/// Receiving half handed to the host.
pub struct EventStream {
    operation_id: String,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    cancel: CancellationToken,
}

pub(crate) fn channel(operation_id: String, cancel: CancellationToken) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink { tx },
        EventStream {
            operation_id,
            rx,
            cancel,
        },
    )
}

impl EventStream {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Next event, `None` once the run has finished and the channel drained.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Ask the run to stop. It ends with a `Cancelled` error event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
