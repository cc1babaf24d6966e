//! `var OP value` conditions used by `$if` instructions and breakpoints.
//!
//! Comparisons are numeric when both sides parse as numbers, string
//! comparisons otherwise. A bare variable name is true when the variable is
//! set to something other than an empty string, `false` or `0`.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Contains => "contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Condition {
    Truthy(String),
    Compare {
        var: String,
        op: CompareOp,
        value: String,
    },
}

// Longest symbols first so `<=` is not read as `<`.
const SYMBOL_OPS: &[(&str, CompareOp)] = &[
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    ("<=", CompareOp::Le),
    (">=", CompareOp::Ge),
    ("<", CompareOp::Lt),
    (">", CompareOp::Gt),
];

impl Condition {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("Condition is empty".to_string());
        }

        if let Some((lhs, rhs)) = split_word(trimmed, " contains ") {
            return Self::compare(lhs, CompareOp::Contains, rhs);
        }

        for (symbol, op) in SYMBOL_OPS {
            if let Some(pos) = trimmed.find(symbol) {
                let lhs = &trimmed[..pos];
                let rhs = &trimmed[pos + symbol.len()..];
                return Self::compare(lhs, *op, rhs);
            }
        }

        let name = strip_braces(trimmed);
        if !is_identifier(name) {
            return Err(format!("Invalid condition: {}", raw));
        }
        Ok(Condition::Truthy(name.to_string()))
    }

    fn compare(lhs: &str, op: CompareOp, rhs: &str) -> Result<Self, String> {
        let var = strip_braces(lhs.trim());
        if !is_identifier(var) {
            return Err(format!("Invalid variable name in condition: {:?}", lhs.trim()));
        }
        Ok(Condition::Compare {
            var: var.to_string(),
            op,
            value: unquote(rhs.trim()).to_string(),
        })
    }

    pub fn variable(&self) -> &str {
        match self {
            Condition::Truthy(var) => var,
            Condition::Compare { var, .. } => var,
        }
    }

    /// Evaluate against a variable lookup. Missing variables compare as
    /// empty strings.
    pub fn evaluate<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            Condition::Truthy(var) => match lookup(var) {
                Some(value) => {
                    let v = value.trim();
                    !(v.is_empty() || v.eq_ignore_ascii_case("false") || v == "0")
                }
                None => false,
            },
            Condition::Compare { var, op, value } => {
                let actual = lookup(var).unwrap_or_default();
                compare_values(actual.trim(), *op, value)
            }
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Truthy(var) => write!(f, "{}", var),
            Condition::Compare { var, op, value } => write!(f, "{} {} {}", var, op.symbol(), value),
        }
    }
}

fn compare_values(actual: &str, op: CompareOp, expected: &str) -> bool {
    if op == CompareOp::Contains {
        return actual.contains(expected);
    }

    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Contains => false,
        };
    }

    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Le => actual <= expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Ge => actual >= expected,
        CompareOp::Contains => false,
    }
}

fn split_word<'a>(s: &'a str, word: &str) -> Option<(&'a str, &'a str)> {
    s.find(word).map(|pos| (&s[..pos], &s[pos + word.len()..]))
}

fn strip_braces(s: &str) -> &str {
    s.strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(s)
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
