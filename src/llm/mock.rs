//! Scripted model client for tests.

use super::client::ModelClient;
use super::models::{FunctionCall, ModelRequest, ModelResponse};
use super::LlmError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedModelClient {
    responses: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<ModelResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(ModelResponse::text(text)));
    }

    pub fn push_calls(&self, calls: Vec<(&str, Value)>) {
        let function_calls = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| FunctionCall {
                id: format!("call_{}", i),
                name: name.to_string(),
                args,
            })
            .collect();
        self.push(Ok(ModelResponse {
            function_calls,
            ..ModelResponse::default()
        }));
    }

    pub fn push(&self, response: Result<ModelResponse, LlmError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::MalformedResponse(
                    "no scripted response left".to_string(),
                ))
            })
    }
}
