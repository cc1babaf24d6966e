//! Request and failure classification
//!
//! The request classifier decides what kind of help the user is asking for
//! and which files they point at; the error classifier turns failures into
//! retry decisions and user-facing hints.

pub mod errors;
pub mod intent;

pub use errors::{ErrorCategory, ErrorClassifier, ErrorDecision};
pub use intent::RequestClassifier;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    ErrorDebug,
    FeatureUpgrade,
    DebugAndUpgrade,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ErrorDebug => "ERROR_DEBUG",
            Intent::FeatureUpgrade => "FEATURE_UPGRADE",
            Intent::DebugAndUpgrade => "DEBUG_AND_UPGRADE",
            Intent::General => "GENERAL",
        }
    }

    /// Lenient parse of model output ("error-debug", "Feature Upgrade", ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "ERROR_DEBUG" | "DEBUG" | "ERROR" => Some(Intent::ErrorDebug),
            "FEATURE_UPGRADE" | "FEATURE" | "UPGRADE" => Some(Intent::FeatureUpgrade),
            "DEBUG_AND_UPGRADE" | "BOTH" => Some(Intent::DebugAndUpgrade),
            "GENERAL" => Some(Intent::General),
            _ => None,
        }
    }

    pub fn involves_debugging(&self) -> bool {
        matches!(self, Intent::ErrorDebug | Intent::DebugAndUpgrade)
    }

    pub fn involves_changes(&self) -> bool {
        matches!(self, Intent::FeatureUpgrade | Intent::DebugAndUpgrade)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Rules,
    Model,
}

/// A `path.ext` mentioned in the request, with a line when one was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: String,
    pub line: Option<u32>,
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.path, line),
            None => f.write_str(&self.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
    pub indicators: Vec<String>,
    pub source: ClassificationSource,
    pub files: Vec<FileReference>,
}

/// Context block prepended to a synthesized prompt. `None` when the request
/// carries nothing worth telling the model.
pub fn context_for(classification: &Classification) -> Option<String> {
    let guidance = match classification.intent {
        Intent::ErrorDebug => {
            "The user is reporting a failure. Reproduce or locate it first, find the root cause, \
             and make the smallest change that fixes it. Explain the cause in your final answer."
        }
        Intent::FeatureUpgrade => {
            "The user is asking for new or changed functionality. Call get_blueprint before \
             editing several files, reuse existing exports, and keep every caller consistent."
        }
        Intent::DebugAndUpgrade => {
            "The user reports a failure and also wants a change. Fix the failure first, confirm \
             the fix, then implement the requested change on top of it."
        }
        Intent::General if classification.files.is_empty() => return None,
        Intent::General => "The user mentions specific files. Read them before answering.",
    };

    let mut out = String::from("## Request Context\n");
    out.push_str(&format!(
        "Intent: {} (confidence {:.2})\n",
        classification.intent, classification.confidence
    ));
    out.push_str(guidance);
    out.push('\n');
    if !classification.files.is_empty() {
        out.push_str("Referenced locations:\n");
        for file in &classification.files {
            out.push_str(&format!("- {}\n", file));
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(intent: Intent, files: Vec<FileReference>) -> Classification {
        Classification {
            intent,
            confidence: 0.9,
            indicators: Vec::new(),
            source: ClassificationSource::Rules,
            files,
        }
    }

    #[test]
    fn intent_parse_is_lenient() {
        assert_eq!(Intent::parse("error-debug"), Some(Intent::ErrorDebug));
        assert_eq!(Intent::parse(" Feature Upgrade "), Some(Intent::FeatureUpgrade));
        assert_eq!(Intent::parse("DEBUG_AND_UPGRADE"), Some(Intent::DebugAndUpgrade));
        assert_eq!(Intent::parse("chit-chat"), None);
    }

    #[test]
    fn serializes_screaming_case() {
        let json = serde_json::to_string(&Intent::DebugAndUpgrade).unwrap();
        assert_eq!(json, "\"DEBUG_AND_UPGRADE\"");
    }

    #[test]
    fn context_lists_locations() {
        let c = classification(
            Intent::ErrorDebug,
            vec![FileReference {
                path: "routes/main.js".into(),
                line: Some(45),
            }],
        );
        let text = context_for(&c).unwrap();
        assert!(text.contains("Intent: ERROR_DEBUG"));
        assert!(text.contains("- routes/main.js:45"));
    }

    #[test]
    fn plain_general_request_has_no_context() {
        assert!(context_for(&classification(Intent::General, Vec::new())).is_none());
    }
}
