//! Provider response parsing.

use super::models::{FunctionCall, ModelResponse, Usage};
use super::LlmError;
use serde_json::Value;

pub fn parse_response(body: &Value) -> Result<ModelResponse, LlmError> {
    let candidate = match body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        Some(candidate) => candidate,
        None => {
            let reason = body
                .get("promptFeedback")
                .and_then(|f| f.get("blockReason"))
                .and_then(Value::as_str);
            return Err(LlmError::MalformedResponse(match reason {
                Some(reason) => format!("prompt blocked by provider ({})", reason),
                None => "response has no candidates".to_string(),
            }));
        }
    };

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(str::to_string);

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut text = String::new();
    let mut function_calls = Vec::new();
    for part in parts {
        // Reasoning summaries are not part of the answer.
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| LlmError::MalformedResponse("function call without a name".into()))?;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", function_calls.len()));
            function_calls.push(FunctionCall {
                id,
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or(Value::Object(Default::default())),
            });
        }
    }

    if text.trim().is_empty() && function_calls.is_empty() {
        return Err(LlmError::MalformedResponse(format!(
            "empty response (finish reason: {})",
            finish_reason.as_deref().unwrap_or("unknown")
        )));
    }

    let usage = body.get("usageMetadata").map(|u| Usage {
        prompt_tokens: u
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        output_tokens: u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    });

    Ok(ModelResponse {
        text,
        function_calls,
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_response() {
        let body = json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "world"}]},
                            "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
        });
        let r = parse_response(&body).unwrap();
        assert_eq!(r.text, "Hello world");
        assert!(!r.has_function_calls());
        assert_eq!(r.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(r.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn mixed_text_and_calls_get_stable_ids() {
        let body = json!({"candidates": [{"content": {"parts": [
            {"text": "Reading both."},
            {"functionCall": {"name": "read_file", "args": {"path": "a.js"}}},
            {"functionCall": {"name": "read_file", "args": {"path": "b.js"}}}
        ]}}]});
        let r = parse_response(&body).unwrap();
        assert_eq!(r.text, "Reading both.");
        let ids: Vec<_> = r.function_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call_0", "call_1"]);
        assert_eq!(r.function_calls[1].args["path"], "b.js");
    }

    #[test]
    fn thoughts_are_skipped() {
        let body = json!({"candidates": [{"content": {"parts": [
            {"text": "thinking...", "thought": true},
            {"text": "answer"}
        ]}}]});
        assert_eq!(parse_response(&body).unwrap().text, "answer");
    }

    #[test]
    fn blocked_and_empty_responses_are_malformed() {
        let blocked = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = parse_response(&blocked).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));

        let empty = json!({"candidates": [{"finishReason": "MAX_TOKENS"}]});
        assert!(matches!(
            parse_response(&empty),
            Err(LlmError::MalformedResponse(_))
        ));

        assert!(parse_response(&json!({})).is_err());
    }
}
