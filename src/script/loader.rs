//! Script files
//!
//! Scripts are JSON documents:
//!
//! ```json
//! {
//!   "metadata": { "name": "triage", "tools_enabled": false },
//!   "parameters": { "lang": "rust" },
//!   "turns": [
//!     {
//!       "label": "ask",
//!       "messages": [
//!         { "role": "user", "content": "Summarize {{lang}}" },
//!         { "role": "assistant", "ai_placeholder": "summary" }
//!       ],
//!       "instructions": [
//!         { "$echo": "{{summary}}" },
//!         { "$if": { "condition": "summary contains TODO", "then": [{ "$goto": "ask" }] } }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Instructions are validated here so the engine only ever sees typed,
//! structurally sound scripts.

use super::condition::Condition;
use super::template::ai_placeholder_name;
use super::{Instruction, Role, Script, ScriptMessage, ScriptMetadata, Turn};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Script is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid script: {0}")]
    Structure(String),
}

#[derive(Deserialize)]
struct RawScript {
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    metadata: ScriptMetadata,
    #[serde(default)]
    turns: Vec<RawTurn>,
}

#[derive(Deserialize)]
struct RawTurn {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    instructions: Vec<Value>,
    #[serde(default)]
    chain_to: Option<String>,
}

#[derive(Deserialize)]
struct RawMessage {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    ai_placeholder: Option<String>,
}

pub fn load_script(path: &Path) -> Result<Script, ScriptError> {
    let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let script = parse_script(&text)?;
    tracing::debug!(
        path = %path.display(),
        turns = script.turns.len(),
        "loaded script"
    );
    Ok(script)
}

pub fn parse_script(text: &str) -> Result<Script, ScriptError> {
    let raw: RawScript = serde_json::from_str(text)?;

    let mut turns = Vec::with_capacity(raw.turns.len());
    for (index, raw_turn) in raw.turns.into_iter().enumerate() {
        turns.push(convert_turn(index, raw_turn)?);
    }

    let script = Script {
        parameters: raw.parameters,
        turns,
        metadata: raw.metadata,
    };
    validate(&script)?;
    Ok(script)
}

fn convert_turn(index: usize, raw: RawTurn) -> Result<Turn, ScriptError> {
    let mut messages = Vec::with_capacity(raw.messages.len());
    for msg in raw.messages {
        let inline = ai_placeholder_name(&msg.content);
        let placeholder = match (msg.ai_placeholder, inline) {
            (Some(explicit), _) => Some(explicit),
            (None, Some(inline)) if msg.role == Role::Assistant => Some(inline),
            _ => None,
        };
        if let Some(var) = &placeholder {
            if msg.role != Role::Assistant {
                return Err(structure(format!(
                    "turn {}: placeholder '{}' must be on an assistant message",
                    index, var
                )));
            }
            if var.trim().is_empty() {
                return Err(structure(format!("turn {}: empty placeholder name", index)));
            }
        }
        messages.push(ScriptMessage {
            role: msg.role,
            content: if placeholder.is_some() {
                String::new()
            } else {
                msg.content
            },
            ai_placeholder_var: placeholder,
        });
    }

    let instructions = raw
        .instructions
        .iter()
        .map(parse_instruction)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| structure(format!("turn {}: {}", index, e)))?;

    Ok(Turn {
        label: raw.label.filter(|l| !l.trim().is_empty()),
        messages,
        instructions,
        chain_to: raw.chain_to.filter(|l| !l.trim().is_empty()),
    })
}

/// One instruction is an object with exactly one `$directive` key.
fn parse_instruction(value: &Value) -> Result<Instruction, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("instruction must be an object, got {}", value))?;
    if obj.len() != 1 {
        return Err(format!(
            "instruction must have exactly one directive, got {}",
            obj.len()
        ));
    }
    let Some((key, arg)) = obj.iter().next() else {
        return Err("empty instruction".to_string());
    };

    match key.as_str() {
        "$echo" => Ok(Instruction::Echo {
            text: string_arg(arg, "$echo")?,
        }),
        "$set" => {
            let args = object_arg(arg, "$set")?;
            let var = args
                .get("var")
                .and_then(Value::as_str)
                .filter(|v| !v.trim().is_empty())
                .ok_or("$set requires a non-empty 'var'")?
                .to_string();
            let value = match args.get("value") {
                Some(v) => super::value_to_string(v),
                None => return Err("$set requires 'value'".to_string()),
            };
            Ok(Instruction::Set { var, value })
        }
        "$if" => {
            let args = object_arg(arg, "$if")?;
            let raw_condition = args
                .get("condition")
                .and_then(Value::as_str)
                .ok_or("$if requires a 'condition' string")?;
            let condition = Condition::parse(raw_condition)?;
            let then = instruction_list(args.get("then"))?;
            let otherwise = instruction_list(args.get("else"))?;
            Ok(Instruction::If {
                condition,
                then,
                otherwise,
            })
        }
        "$goto" => {
            let label = string_arg(arg, "$goto")?;
            if label.trim().is_empty() {
                return Err("$goto requires a label".to_string());
            }
            Ok(Instruction::Goto { label })
        }
        other => Err(format!("unknown directive '{}'", other)),
    }
}

fn instruction_list(value: Option<&Value>) -> Result<Vec<Instruction>, String> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse_instruction).collect(),
        Some(single @ Value::Object(_)) => Ok(vec![parse_instruction(single)?]),
        Some(other) => Err(format!("expected instruction list, got {}", other)),
    }
}

fn string_arg(value: &Value, directive: &str) -> Result<String, String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("{} expects a string argument", directive))
}

fn object_arg<'a>(value: &'a Value, directive: &str) -> Result<&'a Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{} expects an object argument", directive))
}

fn structure(message: String) -> ScriptError {
    ScriptError::Structure(message)
}

/// Whole-script checks: labels are unique and every jump target exists.
pub fn validate(script: &Script) -> Result<(), ScriptError> {
    if script.turns.is_empty() {
        return Err(structure("script has no turns".to_string()));
    }

    let mut labels = HashSet::new();
    for turn in &script.turns {
        if let Some(label) = &turn.label {
            if !labels.insert(label.as_str()) {
                return Err(structure(format!("duplicate turn label '{}'", label)));
            }
        }
    }

    for (index, turn) in script.turns.iter().enumerate() {
        if turn.messages.is_empty() && turn.instructions.is_empty() {
            return Err(structure(format!("turn {} is empty", index)));
        }
        if let Some(target) = &turn.chain_to {
            if !labels.contains(target.as_str()) {
                return Err(structure(format!(
                    "turn {}: chain_to references unknown label '{}'",
                    index, target
                )));
            }
        }
        let mut targets = Vec::new();
        collect_goto_targets(&turn.instructions, &mut targets);
        for target in targets {
            if !labels.contains(target) {
                return Err(structure(format!(
                    "turn {}: $goto references unknown label '{}'",
                    index, target
                )));
            }
        }
    }

    Ok(())
}

fn collect_goto_targets<'a>(instructions: &'a [Instruction], out: &mut Vec<&'a str>) {
    for instruction in instructions {
        match instruction {
            Instruction::Goto { label } => out.push(label),
            Instruction::If {
                then, otherwise, ..
            } => {
                collect_goto_targets(then, out);
                collect_goto_targets(otherwise, out);
            }
            Instruction::Echo { .. } | Instruction::Set { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "metadata": { "name": "triage", "tools_enabled": false },
        "parameters": { "lang": "rust", "retries": 2 },
        "turns": [
            {
                "label": "ask",
                "messages": [
                    { "role": "user", "content": "Summarize {{lang}}" },
                    { "role": "assistant", "ai_placeholder": "summary" }
                ],
                "instructions": [
                    { "$echo": "{{summary}}" },
                    { "$set": { "var": "seen", "value": true } },
                    { "$if": {
                        "condition": "summary contains TODO",
                        "then": [{ "$goto": "ask" }],
                        "else": { "$echo": "done" }
                    } }
                ]
            },
            {
                "messages": [{ "role": "assistant", "content": "{{ai:followup}}" }],
                "chain_to": "ask"
            }
        ]
    }"#;

    #[test]
    fn parses_typed_instructions() {
        let script = parse_script(SAMPLE).unwrap();
        assert_eq!(script.metadata.name.as_deref(), Some("triage"));
        assert!(!script.metadata.tools_enabled);
        assert_eq!(script.turns.len(), 2);

        let first = &script.turns[0];
        assert_eq!(first.label.as_deref(), Some("ask"));
        assert_eq!(
            first.messages[1].ai_placeholder_var.as_deref(),
            Some("summary")
        );
        assert_eq!(
            first.instructions[0],
            Instruction::Echo {
                text: "{{summary}}".to_string()
            }
        );
        assert_eq!(
            first.instructions[1],
            Instruction::Set {
                var: "seen".to_string(),
                value: "true".to_string()
            }
        );
        match &first.instructions[2] {
            Instruction::If {
                then, otherwise, ..
            } => {
                assert_eq!(then.len(), 1);
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected $if, got {:?}", other),
        }

        let second = &script.turns[1];
        assert_eq!(
            second.messages[0].ai_placeholder_var.as_deref(),
            Some("followup")
        );
        assert_eq!(second.chain_to.as_deref(), Some("ask"));
    }

    #[test]
    fn rejects_unknown_directive() {
        let text = r#"{"turns":[{"messages":[{"role":"user","content":"x"}],
            "instructions":[{"$launch":"rockets"}]}]}"#;
        let err = parse_script(text).unwrap_err();
        assert!(err.to_string().contains("unknown directive"));
    }

    #[test]
    fn rejects_dangling_goto_and_chain() {
        let goto = r#"{"turns":[{"messages":[{"role":"user","content":"x"}],
            "instructions":[{"$if":{"condition":"a","then":[{"$goto":"nowhere"}]}}]}]}"#;
        assert!(matches!(
            parse_script(goto),
            Err(ScriptError::Structure(_))
        ));

        let chain = r#"{"turns":[{"messages":[{"role":"user","content":"x"}],"chain_to":"gone"}]}"#;
        assert!(matches!(
            parse_script(chain),
            Err(ScriptError::Structure(_))
        ));
    }

    #[test]
    fn rejects_duplicate_labels_and_empty_scripts() {
        let dup = r#"{"turns":[
            {"label":"a","messages":[{"role":"user","content":"x"}]},
            {"label":"a","messages":[{"role":"user","content":"y"}]}]}"#;
        assert!(parse_script(dup).is_err());
        assert!(parse_script(r#"{"turns":[]}"#).is_err());
    }

    #[test]
    fn placeholder_must_be_assistant() {
        let text = r#"{"turns":[{"messages":[{"role":"user","ai_placeholder":"x"}]}]}"#;
        assert!(parse_script(text).is_err());
    }

    #[test]
    fn load_script_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let script = load_script(file.path()).unwrap();
        assert_eq!(script.initial_variables()["lang"], "rust");

        let missing = load_script(Path::new("/definitely/not/here.json"));
        assert!(matches!(missing, Err(ScriptError::Io { .. })));
    }
}
