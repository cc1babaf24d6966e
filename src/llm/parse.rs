//! Salvaging JSON from model text.
//!
//! Models wrap JSON in code fences, prose, or an extra pair of braces. We try
//! a small, deterministic set of candidate slices and keep the first one that
//! deserializes.

use super::LlmError;
use crate::util::truncate;

const MAX_EMBEDDED_CANDIDATES: usize = 4;
const MAX_ERROR_SNIPPET: usize = 300;

pub fn parse_structured<T>(text: &str) -> Result<T, LlmError>
where
    T: serde::de::DeserializeOwned,
{
    let mut candidates: Vec<String> = Vec::new();
    add_candidate(&mut candidates, text);
    if let Some(inner) = fenced_block(text) {
        add_candidate(&mut candidates, inner);
    }

    let mut i = 0;
    while i < candidates.len() {
        let current = candidates[i].clone();
        for embedded in embedded_json(&current) {
            add_candidate(&mut candidates, &embedded);
        }
        if let Some(inner) = doubled_wrapper(&current) {
            add_candidate(&mut candidates, inner);
        }
        i += 1;
    }

    let mut last_error = None;
    for candidate in &candidates {
        match serde_json::from_str::<T>(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(LlmError::MalformedResponse(format!(
        "expected JSON ({}): {}",
        last_error.unwrap_or_else(|| "empty response".to_string()),
        redact(text)
    )))
}

fn add_candidate(candidates: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if !trimmed.is_empty() && !candidates.iter().any(|c| c == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

/// Body of the first ``` fence, wherever it starts.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n').map(|n| n + 1).unwrap_or(0);
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// `{{ ... }}` or `[[ ... ]]` with the real value inside.
fn doubled_wrapper(text: &str) -> Option<&str> {
    let t = text.trim();
    if t.len() < 4 {
        return None;
    }
    let (open, close) = (t.chars().next()?, t.chars().last()?);
    if !matches!((open, close), ('{', '}') | ('[', ']')) {
        return None;
    }
    let inner = t[1..t.len() - 1].trim();
    inner.starts_with(['{', '[']).then_some(inner)
}

/// Balanced `{...}` / `[...]` slices found inside prose, string-aware.
fn embedded_json(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for (start, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        if let Some(end) = balanced_end(&text[start..]) {
            let slice = &text[start..start + end];
            if !found.iter().any(|f: &String| f == slice) {
                found.push(slice.to_string());
            }
            if found.len() >= MAX_EMBEDDED_CANDIDATES {
                break;
            }
        }
    }
    found
}

/// Byte length of the balanced value starting at the beginning of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Error snippets never echo anything that looks like a credential.
fn redact(text: &str) -> String {
    let lower = text.to_lowercase();
    if ["api_key", "apikey", "secret", "password", "bearer", "aiza"]
        .iter()
        .any(|p| lower.contains(p))
    {
        return "(content redacted)".to_string();
    }
    truncate(text.trim(), MAX_ERROR_SNIPPET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        intent: String,
        confidence: f64,
    }

    #[test]
    fn plain_json() {
        let v: Verdict = parse_structured(r#"{"intent":"GENERAL","confidence":0.5}"#).unwrap();
        assert_eq!(v.intent, "GENERAL");
    }

    #[test]
    fn fenced_json_after_prose() {
        let text = "Here you go:\n```json\n{\"intent\": \"ERROR_DEBUG\", \"confidence\": 0.9}\n```\nThanks";
        let v: Verdict = parse_structured(text).unwrap();
        assert_eq!(v.intent, "ERROR_DEBUG");
    }

    #[test]
    fn embedded_json_with_braces_in_strings() {
        let text = r#"Result: {"intent": "a {weird} one", "confidence": 1} done"#;
        let v: Verdict = parse_structured(text).unwrap();
        assert_eq!(v.intent, "a {weird} one");
    }

    #[test]
    fn doubled_braces() {
        let text = r#"{{"intent": "GENERAL", "confidence": 0.1}}"#;
        let v: Verdict = parse_structured(text).unwrap();
        assert_eq!(v.confidence, 0.1);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_structured::<Verdict>("no json here").unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }
}
