//! `{{var}}` substitution.

use super::Variables;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder regex")
});

/// `{{ai:name}}` as a whole message marks an AI placeholder.
static AI_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\{\{\s*ai:([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}\s*$").expect("ai placeholder regex")
});

/// Substitute known variables; unknown placeholders stay verbatim so the
/// model still sees them.
pub fn render(template: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Substitute known variables; unknown placeholders render empty.
pub fn render_lossy(template: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Variable names referenced by a template, in order of appearance.
pub fn referenced_vars(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

pub fn ai_placeholder_name(content: &str) -> Option<String> {
    AI_PLACEHOLDER
        .captures(content)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_known_and_keeps_unknown() {
        let v = vars(&[("name", "loom")]);
        assert_eq!(render("hi {{name}} {{ missing }}", &v), "hi loom {{ missing }}");
    }

    #[test]
    fn render_lossy_drops_unknown() {
        let v = vars(&[("a", "1")]);
        assert_eq!(render_lossy("{{a}}-{{b}}", &v), "1-");
    }

    #[test]
    fn referenced_vars_dedupes_in_order() {
        assert_eq!(
            referenced_vars("{{b}} {{a}} {{b}}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn ai_placeholder_detection() {
        assert_eq!(ai_placeholder_name(" {{ai:answer}} "), Some("answer".to_string()));
        assert_eq!(ai_placeholder_name("text {{ai:answer}}"), None);
        assert_eq!(ai_placeholder_name("{{answer}}"), None);
    }
}
