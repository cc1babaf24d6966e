//! Script execution engine
//!
//! One execution walks a script turn by turn:
//!
//! 1. **Resolve** the turn's messages into the conversation, asking the model
//!    for every AI placeholder (or once for the turn's answer).
//! 2. **Await** the model. Tool calls in a response are **dispatched**, their
//!    results appended in issue order, and the model is asked again until it
//!    answers with text or the per-turn iteration budget runs out.
//! 3. **Apply** the turn's instructions against the variable store, then move
//!    to the `$goto` target, the `chain_to` label or the next turn.
//!
//! Everything the host sees arrives through one [`EventStream`].

pub mod dispatch;
pub mod events;
pub mod state;

pub use events::{AgentEvent, EventSink, EventStream};
pub use state::{ExecutionState, ExecutionTracker, ToolCallInfo};

use crate::analysis::matrix::render_blueprint;
use crate::analysis::DependencyAnalyzer;
use crate::classify::{context_for, ErrorClassifier, RequestClassifier};
use crate::coherence::FileCoherenceManager;
use crate::config::{Config, EngineConfig};
use crate::debug::{BreakpointRegistry, BreakpointType, CheckContext};
use crate::error::ErrorKind;
use crate::fuzzy::MatchOptions;
use crate::llm::{ChatMessage, FunctionCall, FunctionResponse, LlmError, ModelClient, ModelRequest};
use crate::script::template::{render, render_lossy};
use crate::script::{load_script, loader, Instruction, Role, Script, ScriptError, Turn, Variables};
use crate::tools::{ToolContext, ToolRegistry};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Variable holding the host's message.
pub const USER_MESSAGE_VAR: &str = "user_message";
/// Variable holding the latest turn answer.
pub const LAST_RESPONSE_VAR: &str = "last_response";
/// Variable holding the classified intent of a synthesized conversation.
pub const INTENT_VAR: &str = "intent";

const PLACEHOLDER_ATTEMPTS: usize = 2;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error("Unknown turn label '{0}'")]
    UnknownLabel(String),
    #[error("Placeholder '{var}' in turn {turn} got no content from the model")]
    UnresolvedPlaceholder { var: String, turn: usize },
    #[error("Stopped after {0} turns without reaching the end of the script")]
    TurnBudget(usize),
    #[error("Turn {turn} needed more than {limit} model calls")]
    IterationBudget { turn: usize, limit: usize },
    #[error("Execution cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Script(ScriptError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                ErrorKind::FileNotFound
            }
            EngineError::Script(_)
            | EngineError::UnknownLabel(_)
            | EngineError::UnresolvedPlaceholder { .. } => ErrorKind::ScriptStructure,
            EngineError::Model(err) => err.kind(),
            EngineError::TurnBudget(_) | EngineError::IterationBudget { .. } => {
                ErrorKind::Incomplete
            }
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

enum ScriptSource {
    Message {
        text: String,
        script_path: Option<PathBuf>,
    },
    Script {
        script: Script,
        variables: Variables,
    },
}

/// Per-execution state threaded through the turn loop.
struct Run {
    operation_id: String,
    sink: EventSink,
    cancel: CancellationToken,
    tools: ToolContext,
    tools_enabled: bool,
    variables: Variables,
    history: Vec<ChatMessage>,
    /// System messages from the script, sent as the system instruction.
    system_notes: Vec<String>,
    turn_index: usize,
    last_output: String,
}

/// Cheap to clone; every shared service sits behind an `Arc`.
#[derive(Clone)]
pub struct Engine {
    workspace_root: PathBuf,
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    coherence: Arc<FileCoherenceManager>,
    analyzer: Arc<DependencyAnalyzer>,
    breakpoints: Arc<BreakpointRegistry>,
    tracker: Arc<ExecutionTracker>,
    classifier: Arc<RequestClassifier>,
    errors: ErrorClassifier,
    limits: EngineConfig,
    shell_timeout: Duration,
    max_output_bytes: usize,
    fuzzy: MatchOptions,
}

impl Engine {
    pub fn new(workspace_root: impl Into<PathBuf>, client: Arc<dyn ModelClient>) -> Self {
        let config = Config::default();
        Self {
            workspace_root: workspace_root.into(),
            client,
            registry: Arc::new(ToolRegistry::with_builtin_tools()),
            coherence: Arc::new(FileCoherenceManager::new()),
            analyzer: Arc::new(DependencyAnalyzer::new()),
            breakpoints: Arc::new(BreakpointRegistry::new()),
            tracker: Arc::new(ExecutionTracker::new()),
            classifier: Arc::new(RequestClassifier::new(config.classifier.clone())),
            errors: ErrorClassifier::new(),
            limits: config.engine.clone(),
            shell_timeout: config.tools.shell_timeout(),
            max_output_bytes: config.tools.max_output_bytes,
            fuzzy: MatchOptions::from(&config.fuzzy),
        }
    }

    /// Apply budgets, tool limits and thresholds. Replaces the request
    /// classifier, so call [`Engine::with_classifier`] afterwards.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.limits = config.engine.clone();
        self.shell_timeout = config.tools.shell_timeout();
        self.max_output_bytes = config.tools.max_output_bytes;
        self.fuzzy = MatchOptions::from(&config.fuzzy);
        self.classifier = Arc::new(RequestClassifier::new(config.classifier.clone()));
        self
    }

    pub fn with_limits(mut self, limits: EngineConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_coherence(mut self, coherence: Arc<FileCoherenceManager>) -> Self {
        self.coherence = coherence;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<DependencyAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_breakpoints(mut self, breakpoints: Arc<BreakpointRegistry>) -> Self {
        self.breakpoints = breakpoints;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ExecutionTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointRegistry> {
        &self.breakpoints
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn analyzer(&self) -> &Arc<DependencyAnalyzer> {
        &self.analyzer
    }

    pub fn workspace_root(&self) -> &PathBuf {
        &self.workspace_root
    }

    /// Run `user_message` through the script at `script_path`, or through a
    /// synthesized single-turn conversation when no script is given.
    pub fn send_message(
        &self,
        user_message: impl Into<String>,
        script_path: Option<PathBuf>,
    ) -> EventStream {
        self.spawn(ScriptSource::Message {
            text: user_message.into(),
            script_path,
        })
    }

    /// Run an already-loaded script. `variables` override script parameters.
    pub fn run_script(&self, script: Script, variables: Variables) -> EventStream {
        self.spawn(ScriptSource::Script { script, variables })
    }

    fn spawn(&self, source: ScriptSource) -> EventStream {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (sink, stream) = events::channel(operation_id.clone(), cancel.clone());
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(operation_id, source, sink, cancel).await });
        stream
    }

    async fn execute(
        self,
        operation_id: String,
        source: ScriptSource,
        sink: EventSink,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        info!(operation = %operation_id, "execution started");

        // Tool progress is forwarded as events; the forwarder ends once the
        // run drops its tool context.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = {
            let sink = sink.clone();
            tokio::spawn(async move {
                while let Some(message) = progress_rx.recv().await {
                    sink.emit(AgentEvent::Progress { message });
                }
            })
        };

        let outcome = self
            .drive(&operation_id, source, &sink, &cancel, progress_tx)
            .await;
        let _ = forwarder.await;
        // Clear shared state before the terminal event so hosts never see a
        // finished run that still looks active.
        self.tracker.remove(&operation_id);
        self.breakpoints.clear_operation(&operation_id);

        match outcome {
            Ok((final_content, variables)) => {
                info!(
                    operation = %operation_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "execution finished"
                );
                sink.emit(AgentEvent::Done {
                    final_content,
                    variables,
                });
            }
            Err(err) => {
                warn!(operation = %operation_id, kind = %err.kind(), "execution failed: {}", err);
                sink.emit(self.error_event(&err));
            }
        }
    }

    fn error_event(&self, err: &EngineError) -> AgentEvent {
        let decision = match err {
            EngineError::Model(llm) => self.errors.classify_llm(llm),
            other => self.errors.classify(other.kind(), &other.to_string()),
        };
        AgentEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
            hint: decision
                .surface_to_user
                .then(|| decision.hint.to_string()),
            retry_after: decision.retry_after,
        }
    }

    /// LoadScript, then the turn loop.
    async fn drive(
        &self,
        operation_id: &str,
        source: ScriptSource,
        sink: &EventSink,
        cancel: &CancellationToken,
        progress: mpsc::UnboundedSender<String>,
    ) -> Result<(String, Variables), EngineError> {
        let (script, variables) = self.load(source, cancel).await?;

        let mut tools = ToolContext::new(
            self.workspace_root.clone(),
            self.coherence.clone(),
            self.analyzer.clone(),
        );
        tools.cancel = cancel.clone();
        tools.progress = Some(progress);
        tools.shell_timeout = self.shell_timeout;
        tools.max_output_bytes = self.max_output_bytes;
        tools.fuzzy = self.fuzzy;

        let mut run = Run {
            operation_id: operation_id.to_string(),
            sink: sink.clone(),
            cancel: cancel.clone(),
            tools,
            tools_enabled: script.metadata.tools_enabled,
            variables,
            history: Vec::new(),
            system_notes: Vec::new(),
            turn_index: 0,
            last_output: String::new(),
        };
        self.tracker
            .register(operation_id, script.turns.len(), run.variables.clone());

        let mut index = 0usize;
        let mut executed = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            executed += 1;
            if executed > self.limits.max_turns {
                return Err(EngineError::TurnBudget(self.limits.max_turns));
            }

            let turn = &script.turns[index];
            let location = turn_location(turn, index);
            run.turn_index = index;
            self.tracker.set_turn(operation_id, index);
            debug!(operation = operation_id, turn = %location, "turn started");

            self.checkpoint(&mut run, BreakpointType::Turn, &location).await?;
            self.checkpoint(&mut run, BreakpointType::Condition, &location)
                .await?;

            self.resolve_turn(&mut run, turn, index).await?;
            let jump = self
                .apply_instructions(&mut run, &turn.instructions, &location)
                .await?;

            let next = match jump.or_else(|| turn.chain_to.clone()) {
                Some(label) => Some(
                    script
                        .turn_index(&label)
                        .ok_or(EngineError::UnknownLabel(label))?,
                ),
                None if index + 1 < script.turns.len() => Some(index + 1),
                None => None,
            };
            match next {
                Some(next) => index = next,
                None => break,
            }
        }

        Ok((run.last_output, run.variables))
    }

    async fn load(
        &self,
        source: ScriptSource,
        cancel: &CancellationToken,
    ) -> Result<(Script, Variables), EngineError> {
        match source {
            ScriptSource::Message {
                text,
                script_path: Some(path),
            } => {
                let script = tokio::task::spawn_blocking(move || load_script(&path))
                    .await
                    .map_err(|e| {
                        ScriptError::Structure(format!("script loader failed: {}", e))
                    })??;
                let mut variables = script.initial_variables();
                variables.insert(USER_MESSAGE_VAR.to_string(), text);
                Ok((script, variables))
            }
            ScriptSource::Message {
                text,
                script_path: None,
            } => {
                let classification = self.classifier.classify(&text, cancel).await;
                info!(
                    intent = %classification.intent,
                    confidence = classification.confidence,
                    "request classified"
                );

                let mut context = context_for(&classification);
                if self.limits.attach_blueprint && classification.intent.involves_changes() {
                    let matrix = self.analyzer.matrix(&self.workspace_root);
                    if !matrix.is_empty() {
                        let block = context.get_or_insert_with(String::new);
                        if !block.is_empty() {
                            block.push('\n');
                        }
                        block.push_str(&render_blueprint(&matrix));
                    }
                }

                let script = Script::synthesize(&text, context.as_deref());
                let mut variables = script.initial_variables();
                variables.insert(USER_MESSAGE_VAR.to_string(), text);
                variables.insert(
                    INTENT_VAR.to_string(),
                    classification.intent.as_str().to_string(),
                );
                Ok((script, variables))
            }
            ScriptSource::Script { script, variables } => {
                loader::validate(&script)?;
                let mut merged = script.initial_variables();
                merged.extend(variables);
                Ok((script, merged))
            }
        }
    }

    /// Append the turn's messages, filling placeholders, and ask for the
    /// turn's answer when it has none.
    async fn resolve_turn(&self, run: &mut Run, turn: &Turn, index: usize) -> Result<(), EngineError> {
        for message in &turn.messages {
            match &message.ai_placeholder_var {
                Some(var) => {
                    let text = self.fill_placeholder(run, var, index).await?;
                    self.assign(run, var, text).await?;
                }
                None => {
                    let content = render(&message.content, &run.variables);
                    match message.role {
                        Role::System => run.system_notes.push(content),
                        Role::User => run.history.push(ChatMessage::user(content)),
                        Role::Assistant => run.history.push(ChatMessage::assistant(content)),
                    }
                }
            }
        }

        let needs_answer = !turn.has_placeholder()
            && turn
                .messages
                .last()
                .is_some_and(|m| m.role != Role::Assistant);
        if needs_answer {
            let text = self.model_round(run, index).await?;
            run.sink.chunk(text.clone());
            run.last_output = text.clone();
            self.assign(run, LAST_RESPONSE_VAR, text).await?;
        }
        Ok(())
    }

    async fn fill_placeholder(&self, run: &mut Run, var: &str, index: usize) -> Result<String, EngineError> {
        for attempt in 1..=PLACEHOLDER_ATTEMPTS {
            let text = self.model_round(run, index).await?;
            if !text.trim().is_empty() {
                return Ok(text);
            }
            debug!(var, attempt, "model left placeholder empty");
            run.history.push(ChatMessage::user(format!(
                "Your previous reply was empty. Reply with the content for '{}'.",
                var
            )));
        }
        Err(EngineError::UnresolvedPlaceholder {
            var: var.to_string(),
            turn: index,
        })
    }

    /// Call the model until it answers with text, dispatching tool calls in
    /// between.
    async fn model_round(&self, run: &mut Run, index: usize) -> Result<String, EngineError> {
        let limit = self.limits.max_tool_iterations.max(1);
        for iteration in 1..=limit {
            let request = self.build_request(run);
            debug!(
                operation = %run.operation_id,
                turn = index,
                iteration,
                messages = request.messages.len(),
                "calling model"
            );
            let response = self.client.generate(&request, &run.cancel).await?;
            run.history.push(ChatMessage::from_response(&response));

            if !response.has_function_calls() {
                return Ok(response.text);
            }
            let results = self.dispatch_tools(run, response.function_calls, index).await?;
            run.history.push(ChatMessage::tool_results(results));
        }
        Err(EngineError::IterationBudget { turn: index, limit })
    }

    fn build_request(&self, run: &Run) -> ModelRequest {
        let mut request = ModelRequest::new(run.history.clone());
        if run.tools_enabled && !self.registry.is_empty() {
            request = request.with_tools(self.registry.declarations());
        }
        if !run.system_notes.is_empty() {
            request.system_instruction = Some(run.system_notes.join("\n\n"));
        }
        request
    }

    async fn dispatch_tools(
        &self,
        run: &mut Run,
        calls: Vec<FunctionCall>,
        index: usize,
    ) -> Result<Vec<FunctionResponse>, EngineError> {
        for call in &calls {
            self.checkpoint(run, BreakpointType::ToolCall, &call.name)
                .await?;
            run.sink.emit(AgentEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
            });
            self.tracker
                .start_tool_call(&run.operation_id, &call.id, &call.name, &call.args, index);
        }

        let issued: Vec<(String, String)> = calls
            .iter()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();
        let prepared = calls
            .into_iter()
            .map(|call| dispatch::prepare(&self.registry, call, run.tools_enabled))
            .collect();
        let results =
            dispatch::execute_calls(prepared, &run.tools, self.limits.parallel_tools).await;
        if run.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut responses = Vec::with_capacity(results.len());
        for ((id, name), result) in issued.into_iter().zip(results) {
            debug!(
                tool = %name,
                ok = !result.is_error(),
                "tool finished: {}",
                result.display_text
            );
            self.tracker.finish_tool_call(&run.operation_id, &id, &result);
            let mut response = result.to_model_response();
            if let Some(err) = &result.error {
                let decision = self.errors.classify(err.kind, &err.message);
                if !decision.surface_to_user {
                    response["hint"] = json!(decision.hint);
                }
            }
            responses.push(FunctionResponse {
                id: id.clone(),
                name: name.clone(),
                response,
            });
            run.sink.emit(AgentEvent::ToolResult { id, name, result });
        }
        Ok(responses)
    }

    /// Run instructions in order. Returns the `$goto` target, which ends the
    /// turn's instructions immediately.
    async fn apply_instructions(
        &self,
        run: &mut Run,
        instructions: &[Instruction],
        location: &str,
    ) -> Result<Option<String>, EngineError> {
        let mut stack = vec![instructions.iter()];
        while let Some(frame) = stack.last_mut() {
            let Some(instruction) = frame.next() else {
                stack.pop();
                continue;
            };
            let at = format!("{}:{}", location, instruction.name());
            self.checkpoint(run, BreakpointType::Instruction, &at).await?;

            match instruction {
                Instruction::Echo { text } => {
                    let out = render_lossy(text, &run.variables);
                    run.sink.chunk(out.clone());
                    run.last_output = out;
                }
                Instruction::Set { var, value } => {
                    let value = render_lossy(value, &run.variables);
                    self.assign(run, var, value).await?;
                }
                Instruction::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    let taken = condition.evaluate(|name| run.variables.get(name).cloned());
                    debug!(condition = %condition, taken, "if");
                    stack.push(if taken { then.iter() } else { otherwise.iter() });
                }
                Instruction::Goto { label } => return Ok(Some(label.clone())),
            }
        }
        Ok(None)
    }

    async fn assign(&self, run: &mut Run, var: &str, value: String) -> Result<(), EngineError> {
        run.variables.insert(var.to_string(), value);
        self.tracker.set_variables(&run.operation_id, &run.variables);
        self.checkpoint(run, BreakpointType::Variable, var).await
    }

    /// Pause here if a breakpoint (or a pending step) says so.
    async fn checkpoint(&self, run: &mut Run, kind: BreakpointType, location: &str) -> Result<(), EngineError> {
        let tool_calls = self
            .tracker
            .get(&run.operation_id)
            .map(|state| state.tool_calls)
            .unwrap_or_default();
        let ctx = CheckContext {
            turn_index: run.turn_index,
            variables: &run.variables,
            tool_calls: &tool_calls,
        };
        if self
            .breakpoints
            .check_breakpoint(&run.operation_id, kind, location, &ctx)
            .is_some()
        {
            self.breakpoints
                .wait_while_paused(&run.operation_id, &run.cancel)
                .await
                .map_err(|_| EngineError::Cancelled)?;
        }
        Ok(())
    }
}

/// Label when the turn has one, otherwise its index.
fn turn_location(turn: &Turn, index: usize) -> String {
    turn.label.clone().unwrap_or_else(|| index.to_string())
}
