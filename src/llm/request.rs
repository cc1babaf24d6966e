//! Provider payload construction (`generateContent` wire format).

use super::models::{ChatMessage, ChatRole, ModelRequest, Part};
use super::prompts::AGENT_SYSTEM_PROMPT;
use serde_json::{json, Map, Value};

pub fn build_payload(request: &ModelRequest) -> Value {
    let contents: Vec<Value> = request.messages.iter().map(content_entry).collect();

    let mut payload = Map::new();
    payload.insert("contents".to_string(), Value::Array(contents));

    let tools_on = request.tools_enabled && !request.tools.is_empty();
    let mut system_text = Vec::new();
    if tools_on {
        payload.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": request.tools }]),
        );
        payload.insert(
            "toolConfig".to_string(),
            json!({ "functionCallingConfig": { "mode": "AUTO" } }),
        );
        system_text.push(AGENT_SYSTEM_PROMPT);
    } else {
        payload.insert(
            "toolConfig".to_string(),
            json!({ "functionCallingConfig": { "mode": "NONE" } }),
        );
    }
    if let Some(extra) = request.system_instruction.as_deref() {
        if !extra.trim().is_empty() {
            system_text.push(extra);
        }
    }
    if !system_text.is_empty() {
        payload.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system_text.join("\n\n") }] }),
        );
    }

    let mut generation = Map::new();
    if let Some(max) = request.max_output_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if request.json_response {
        generation.insert("responseMimeType".to_string(), json!("application/json"));
    }
    if !generation.is_empty() {
        payload.insert("generationConfig".to_string(), Value::Object(generation));
    }

    Value::Object(payload)
}

/// Provider role for a chat role. `contents` only accepts `user` and
/// `model`; system messages are sent as user turns.
fn provider_role(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User | ChatRole::Tool => "user",
        ChatRole::Assistant => "model",
        ChatRole::System => {
            tracing::warn!("system message in conversation history sent with role 'user'");
            "user"
        }
    }
}

fn content_entry(message: &ChatMessage) -> Value {
    let parts: Vec<Value> = message
        .parts
        .iter()
        .map(|part| match part {
            Part::Text(text) => json!({ "text": text }),
            Part::FunctionCall(call) => json!({
                "functionCall": { "name": call.name, "args": call.args }
            }),
            Part::FunctionResponse(resp) => json!({
                "functionResponse": { "name": resp.name, "response": resp.response }
            }),
        })
        .collect();
    json!({ "role": provider_role(message.role), "parts": parts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::models::{FunctionCall, FunctionDeclaration, FunctionResponse};

    fn declaration() -> FunctionDeclaration {
        FunctionDeclaration {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        }
    }

    #[test]
    fn tools_enabled_includes_declarations_and_system_prompt() {
        let request = ModelRequest::new(vec![ChatMessage::user("hi")]).with_tools(vec![declaration()]);
        let payload = build_payload(&request);
        assert_eq!(
            payload["tools"][0]["functionDeclarations"][0]["name"],
            "read_file"
        );
        let system = payload["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(system.contains("get_blueprint"));
        assert_eq!(payload["toolConfig"]["functionCallingConfig"]["mode"], "AUTO");
    }

    #[test]
    fn tools_disabled_sets_mode_none_and_omits_prompt() {
        let request = ModelRequest::new(vec![ChatMessage::user("hi")]);
        let payload = build_payload(&request);
        assert!(payload.get("tools").is_none());
        assert!(payload.get("systemInstruction").is_none());
        assert_eq!(payload["toolConfig"]["functionCallingConfig"]["mode"], "NONE");
    }

    #[test]
    fn explicit_instruction_is_sent_without_tools() {
        let mut request = ModelRequest::new(vec![ChatMessage::user("classify")]);
        request.system_instruction = Some("Reply with JSON".to_string());
        request.json_response = true;
        let payload = build_payload(&request);
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "Reply with JSON"
        );
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn roles_are_mapped_and_system_is_coerced() {
        let call = FunctionCall {
            id: "call_0".to_string(),
            name: "read_file".to_string(),
            args: json!({"path": "a"}),
        };
        let request = ModelRequest::new(vec![
            ChatMessage::system("context"),
            ChatMessage::user("go"),
            ChatMessage {
                role: ChatRole::Assistant,
                parts: vec![Part::FunctionCall(call)],
            },
            ChatMessage::tool_results(vec![FunctionResponse {
                id: "call_0".to_string(),
                name: "read_file".to_string(),
                response: json!({"content": "x"}),
            }]),
        ]);
        let payload = build_payload(&request);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "context");
        assert_eq!(contents[2]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["functionCall"]["name"], "read_file");
        assert_eq!(contents[3]["role"], "user");
        assert_eq!(
            contents[3]["parts"][0]["functionResponse"]["response"]["content"],
            "x"
        );
    }
}
