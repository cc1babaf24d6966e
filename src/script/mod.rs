//! Script model
//!
//! A script is an ordered list of turns. Each turn carries the messages sent
//! to the model, optional AI placeholders the model must fill, and the
//! instructions applied once the messages are resolved. Scripts are immutable
//! after loading; the engine only reads them.

pub mod condition;
pub mod loader;
pub mod template;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use condition::Condition;
pub use loader::{load_script, parse_script, ScriptError};

/// Variable store shared by templates, instructions and conditions.
pub type Variables = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptMessage {
    pub role: Role,
    /// Template text, may contain `{{var}}` placeholders.
    pub content: String,
    /// When set, the model produces this message and its text is stored in
    /// the named variable.
    pub ai_placeholder_var: Option<String>,
}

impl ScriptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ai_placeholder_var: None,
        }
    }

    pub fn placeholder(var: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            ai_placeholder_var: Some(var.into()),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.ai_placeholder_var.is_some()
    }
}

/// Post-turn directive, validated at load time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Emit rendered text to the host.
    Echo { text: String },
    /// Store a rendered value into a variable.
    Set { var: String, value: String },
    /// Run one of two instruction lists depending on a condition.
    If {
        condition: Condition,
        then: Vec<Instruction>,
        otherwise: Vec<Instruction>,
    },
    /// Continue with the turn carrying this label.
    Goto { label: String },
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Echo { .. } => "echo",
            Instruction::Set { .. } => "set",
            Instruction::If { .. } => "if",
            Instruction::Goto { .. } => "goto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Turn {
    pub label: Option<String>,
    pub messages: Vec<ScriptMessage>,
    pub instructions: Vec<Instruction>,
    pub chain_to: Option<String>,
}

impl Turn {
    pub fn has_placeholder(&self) -> bool {
        self.messages.iter().any(ScriptMessage::is_placeholder)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Expose tools to the model while running this script.
    #[serde(default = "default_tools_enabled")]
    pub tools_enabled: bool,
}

fn default_tools_enabled() -> bool {
    true
}

impl Default for ScriptMetadata {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            tools_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Script {
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub turns: Vec<Turn>,
    pub metadata: ScriptMetadata,
}

impl Script {
    /// Single-turn script wrapping a user message, used when the host does
    /// not supply a script file.
    pub fn synthesize(user_message: &str, context: Option<&str>) -> Self {
        let mut messages = Vec::new();
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            messages.push(ScriptMessage::new(Role::System, context));
        }
        messages.push(ScriptMessage::new(Role::User, user_message));

        Self {
            parameters: BTreeMap::new(),
            turns: vec![Turn {
                label: None,
                messages,
                instructions: Vec::new(),
                chain_to: None,
            }],
            metadata: ScriptMetadata {
                name: Some("conversation".to_string()),
                description: None,
                tools_enabled: true,
            },
        }
    }

    pub fn turn_index(&self, label: &str) -> Option<usize> {
        self.turns
            .iter()
            .position(|t| t.label.as_deref() == Some(label))
    }

    /// Initial variable store built from the script parameters.
    pub fn initial_variables(&self) -> Variables {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }
}

/// String form of a JSON value as seen by templates.
pub fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
