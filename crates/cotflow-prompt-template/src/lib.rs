//! Prompt rendering for cotflow phase strategies.
//!
//! Templates are plain text with `{name}` placeholders, where `name` is made of
//! ASCII letters, digits and `_`. Rendering is pure: the same template and
//! context always produce the same text.
//!
//! | Context value | Substituted text |
//! |---------------|------------------|
//! | string | the string itself, unquoted |
//! | number, bool | its display form |
//! | null | `null` |
//! | array, object | pretty-printed JSON |
//! | absent | the placeholder, unchanged |
//!
//! Leaving unknown placeholders in place keeps a half-configured prompt
//! readable, which makes it obvious in a dry run which variable is missing.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"));

/// Render `template`, substituting every placeholder found in `context`.
///
/// # Example
///
/// ```rust
/// use cotflow_prompt_template::render;
/// use serde_json::json;
///
/// let ctx = json!({"name": "Sam", "topics": ["a", "b"]});
/// let out = render("Hi {name}, topics: {topics}", ctx.as_object().unwrap());
/// assert!(out.starts_with("Hi Sam, topics: ["));
/// assert!(out.contains("\"a\""));
///
/// let empty = serde_json::Map::new();
/// assert_eq!(render("Val: {missing}", &empty), "Val: {missing}");
/// ```
#[must_use]
pub fn render(template: &str, context: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match context.get(&caps[1]) {
            Some(value) => value_to_text(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Text form of a single context value, as substituted by [`render`].
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite @ (Value::Array(_) | Value::Object(_)) => {
            serde_json::to_string_pretty(composite).unwrap_or_else(|_| composite.to_string())
        }
    }
}

/// Distinct placeholder names in order of first appearance.
///
/// ```rust
/// use cotflow_prompt_template::placeholders;
///
/// assert_eq!(placeholders("{a} {b} {a}"), vec!["a", "b"]);
/// ```
#[must_use]
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Placeholders of `template` that `context` does not define.
#[must_use]
pub fn missing_placeholders(template: &str, context: &Map<String, Value>) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|name| !context.contains_key(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_scalar_substitution() {
        let c = ctx(json!({"name": "Sam", "n": 3, "ok": true, "none": null}));
        assert_eq!(
            render("{name}/{n}/{ok}/{none}", &c),
            "Sam/3/true/null"
        );
    }

    #[test]
    fn test_composite_is_pretty_json() {
        let c = ctx(json!({"name": "Sam", "topics": ["a", "b"]}));
        let out = render("Hi {name}, topics: {topics}", &c);
        assert!(out.contains("Sam"));
        let json_part = out.split("topics: ").nth(1).unwrap();
        let parsed: Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(parsed, json!(["a", "b"]));
        assert!(json_part.contains('\n'));
    }

    #[test]
    fn test_missing_left_literal() {
        assert_eq!(render("Val: {missing}", &Map::new()), "Val: {missing}");
    }

    #[test]
    fn test_non_identifier_braces_untouched() {
        let c = ctx(json!({"a": "x"}));
        assert_eq!(render("{ a } {a-b} {} {a}", &c), "{ a } {a-b} {} x");
    }

    #[test]
    fn test_substituted_text_is_not_rescanned() {
        let c = ctx(json!({"a": "{b}", "b": "nope"}));
        assert_eq!(render("{a}", &c), "{b}");
    }

    #[test]
    fn test_object_values_render_nested_braces() {
        let c = ctx(json!({"cfg": {"topic": "X"}}));
        let out = render("cfg={cfg}", &c);
        assert!(out.starts_with("cfg={"));
        assert!(out.contains("\"topic\": \"X\""));
    }

    #[test]
    fn test_missing_placeholders() {
        let c = ctx(json!({"a": 1}));
        assert_eq!(missing_placeholders("{a}{b}{c}{b}", &c), vec!["b", "c"]);
    }

    proptest! {
        #[test]
        fn prop_template_without_placeholders_is_identity(s in "[^{}]*") {
            prop_assert_eq!(render(&s, &Map::new()), s);
        }

        #[test]
        fn prop_empty_context_is_identity(s in "[a-z{} _]{0,40}") {
            prop_assert_eq!(render(&s, &Map::new()), s);
        }

        #[test]
        fn prop_string_values_substituted_verbatim(key in "[a-z_]{1,10}", value in "[^{}]{0,30}") {
            let mut c = Map::new();
            c.insert(key.clone(), Value::String(value.clone()));
            let template = format!("<{{{key}}}>");
            prop_assert_eq!(render(&template, &c), format!("<{value}>"));
        }
    }
}
