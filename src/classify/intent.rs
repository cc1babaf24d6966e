use super::{Classification, ClassificationSource, FileReference, Intent};
use crate::config::ClassifierConfig;
use crate::llm::prompts::CLASSIFIER_PROMPT;
use crate::llm::{parse_structured, ChatMessage, ModelClient, ModelRequest};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "errors",
    "exception",
    "crash",
    "crashes",
    "crashing",
    "bug",
    "broken",
    "fails",
    "failing",
    "failed",
    "failure",
    "not working",
    "doesn't work",
    "does not work",
    "stack trace",
    "traceback",
    "undefined",
    "segfault",
    "panic",
    "fix",
];

const UPGRADE_KEYWORDS: &[&str] = &[
    "add",
    "implement",
    "feature",
    "upgrade",
    "improve",
    "refactor",
    "create",
    "build",
    "support",
    "enhance",
    "migrate",
    "optimize",
    "extend",
    "rewrite",
];

const PROBLEM_KEYWORDS: &[&str] = &[
    "issue",
    "problem",
    "wrong",
    "unexpected",
    "instead of",
    "should not",
    "shouldn't",
    "why does",
];

const SOURCE_EXTENSIONS: &str =
    "js|jsx|mjs|cjs|ts|tsx|py|java|kt|kts|rs|go|rb|php|c|cc|cpp|h|hpp|cs|swift|vue|svelte|json|ya?ml|toml|gradle|xml|html|css|scss|sql|sh";

fn keyword_regex(words: &[&str]) -> Regex {
    let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).expect("valid regex")
}

static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| keyword_regex(ERROR_KEYWORDS));
static UPGRADE_RE: LazyLock<Regex> = LazyLock::new(|| keyword_regex(UPGRADE_KEYWORDS));
static PROBLEM_RE: LazyLock<Regex> = LazyLock::new(|| keyword_regex(PROBLEM_KEYWORDS));

/// Shapes that only show up in real error output.
static ERROR_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b[A-Z][A-Za-z]*(?:Error|Exception)\b:?",
        r"\bat\s+[\w./\\-]+\.\w+:\d+",
        r"Traceback \(most recent call last\)",
        r"(?i)\bis not (?:a function|defined)\b",
        r"(?i)\bcannot read propert(?:y|ies)\b",
        r"(?i)\bnull ?pointer\b",
        r"(?i)\bexit (?:code|status) [1-9]\d*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static FILE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"([A-Za-z0-9_./\\-]*[A-Za-z0-9_]\.(?:{}))\b(?::(\d+))?",
        SOURCE_EXTENSIONS
    ))
    .expect("valid regex")
});

static PY_TRACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("valid regex"));

static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:what|how|why|where|when|which|who|explain|describe|can you tell)\b")
        .expect("valid regex")
});

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    intent: String,
    confidence: f64,
    #[serde(default)]
    indicators: Vec<String>,
}

/// Rule-based intent detection with an optional model fallback.
pub struct RequestClassifier {
    config: ClassifierConfig,
    client: Option<Arc<dyn ModelClient>>,
}

impl RequestClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    pub fn with_model(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Rules first. Confident results return without a model call; otherwise
    /// the model gets one tool-less attempt and any failure keeps the rule
    /// result.
    pub async fn classify(&self, message: &str, cancel: &CancellationToken) -> Classification {
        let rules = self.classify_rules(message);
        if rules.confidence >= self.config.high_confidence || !self.config.use_model_fallback {
            return rules;
        }
        let Some(client) = self.client.as_ref() else {
            return rules;
        };

        let mut request = ModelRequest::new(vec![ChatMessage::user(message)]);
        request.system_instruction = Some(CLASSIFIER_PROMPT.to_string());
        request.json_response = true;
        request.temperature = Some(0.0);
        request.max_output_tokens = Some(256);

        let verdict = match client.generate(&request, cancel).await {
            Ok(response) => parse_structured::<ModelVerdict>(&response.text),
            Err(err) => Err(err),
        };
        match verdict {
            Ok(verdict) => match Intent::parse(&verdict.intent) {
                Some(intent) => Classification {
                    intent,
                    confidence: verdict.confidence.clamp(0.0, 1.0),
                    indicators: verdict.indicators,
                    source: ClassificationSource::Model,
                    files: rules.files,
                },
                None => {
                    debug!("model returned unknown intent '{}'", verdict.intent);
                    rules
                }
            },
            Err(err) => {
                debug!("intent classification fell back to rules: {}", err);
                rules
            }
        }
    }

    pub fn classify_rules(&self, message: &str) -> Classification {
        let mut indicators = Vec::new();
        let mut push = |s: &str| {
            let s = s.trim().to_string();
            if !indicators.contains(&s) {
                indicators.push(s);
            }
        };

        let shapes: Vec<&str> = ERROR_SHAPES
            .iter()
            .filter_map(|re| re.find(message).map(|m| m.as_str()))
            .collect();
        let error_hits = collect_hits(&ERROR_RE, message);
        let upgrade_hits = collect_hits(&UPGRADE_RE, message);
        let problem_hits = collect_hits(&PROBLEM_RE, message);

        for hit in shapes.iter().copied().chain(error_hits.iter().map(String::as_str)) {
            push(hit);
        }
        for hit in problem_hits.iter().chain(upgrade_hits.iter()) {
            push(hit.as_str());
        }

        let debug_score =
            shapes.len() as f64 * 2.0 + error_hits.len() as f64 + problem_hits.len() as f64 * 0.5;
        let upgrade_score = upgrade_hits.len() as f64;

        let (intent, confidence) = if debug_score == 0.0 && upgrade_score == 0.0 {
            if QUESTION_RE.is_match(message) || message.trim_end().ends_with('?') {
                (Intent::General, 0.7)
            } else {
                (Intent::General, 0.5)
            }
        } else if upgrade_score == 0.0 || debug_score > upgrade_score * 2.0 {
            (Intent::ErrorDebug, score_confidence(debug_score))
        } else if debug_score == 0.0 || upgrade_score > debug_score * 2.0 {
            (Intent::FeatureUpgrade, score_confidence(upgrade_score))
        } else {
            (
                Intent::DebugAndUpgrade,
                (0.5 + 0.1 * (debug_score + upgrade_score)).min(0.9),
            )
        };

        Classification {
            intent,
            confidence,
            indicators,
            source: ClassificationSource::Rules,
            files: extract_file_references(message),
        }
    }
}

fn score_confidence(score: f64) -> f64 {
    (0.5 + 0.15 * score).min(0.95)
}

fn collect_hits(re: &Regex, message: &str) -> Vec<String> {
    let mut hits: Vec<String> = Vec::new();
    for m in re.find_iter(message) {
        let hit = m.as_str().to_lowercase();
        if !hits.contains(&hit) {
            hits.push(hit);
        }
    }
    hits
}

/// `path.ext[:line]` mentions and Python traceback frames, in order of
/// appearance. A later mention with a line number upgrades an earlier one
/// without.
pub fn extract_file_references(message: &str) -> Vec<FileReference> {
    let mut found: Vec<(usize, FileReference)> = Vec::new();

    for caps in PY_TRACE_RE.captures_iter(message) {
        if let (Some(m), Some(line)) = (caps.get(1), caps.get(2)) {
            found.push((
                m.start(),
                FileReference {
                    path: m.as_str().to_string(),
                    line: line.as_str().parse().ok(),
                },
            ));
        }
    }
    for caps in FILE_LINE_RE.captures_iter(message) {
        let Some(m) = caps.get(1) else { continue };
        let path = m.as_str().trim_start_matches("./").to_string();
        if path.starts_with('.') || path.contains("://") {
            continue;
        }
        found.push((
            m.start(),
            FileReference {
                path,
                line: caps.get(2).and_then(|l| l.as_str().parse().ok()),
            },
        ));
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut refs: Vec<FileReference> = Vec::new();
    for (_, reference) in found {
        match refs.iter_mut().find(|r| r.path == reference.path) {
            Some(existing) if existing.line.is_none() => existing.line = reference.line,
            Some(existing) if reference.line.is_none() || existing.line == reference.line => {}
            _ => refs.push(reference),
        }
    }
    refs
}
