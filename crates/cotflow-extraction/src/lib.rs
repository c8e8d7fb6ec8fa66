//! Tolerant decoding of structured (JSON) output from completion backends.
//!
//! Models asked for JSON routinely return something close to it: wrapped in a
//! markdown fence, preceded by a sentence of prose, containing raw newlines
//! inside string literals, or with a trailing comma. [`decode`] applies a fixed
//! sequence of repairs and reports which ones it needed. Business logic never
//! performs string surgery of its own; it calls this crate.
//!
//! Repair order for each candidate span:
//!
//! 1. parse as-is
//! 2. escape raw control characters inside string literals
//! 3. drop trailing commas before `}` / `]`
//!
//! Candidate spans, tried in order: the whole trimmed text, the body of the
//! first fenced code block, and the first balanced `{...}` / `[...]` span.

mod repair;

use cotflow_utils::error::DecodeError;
use serde_json::Value;
use tracing::debug;

pub use repair::{balanced_span, escape_control_chars_in_strings, fenced_body, remove_trailing_commas};

/// A repair that had to be applied before the text parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// Content was taken from inside a markdown code fence
    StrippedFence,
    /// Content was cut out of surrounding prose
    ExtractedSpan,
    /// Raw control characters inside strings were escaped
    EscapedControlChars,
    /// Trailing commas were removed
    RemovedTrailingCommas,
}

/// Successfully decoded output.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub value: Value,
    pub repairs: Vec<Repair>,
}

impl Decoded {
    #[must_use]
    pub fn was_repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}

/// Decode `text` as JSON, repairing common model-output defects.
///
/// # Errors
///
/// [`DecodeError::Empty`] for blank input; [`DecodeError::Unparseable`] with
/// the verbatim text when no repair produces valid JSON.
///
/// # Example
///
/// ```rust
/// use cotflow_extraction::{decode, Repair};
/// use serde_json::json;
///
/// let text = "Sure! Here it is:\n```json\n{\"topics\": [\"a\", \"b\",]}\n```";
/// let decoded = decode(text).unwrap();
/// assert_eq!(decoded.value, json!({"topics": ["a", "b"]}));
/// assert!(decoded.repairs.contains(&Repair::StrippedFence));
/// assert!(decoded.repairs.contains(&Repair::RemovedTrailingCommas));
/// ```
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut candidates: Vec<(&str, Vec<Repair>)> = vec![(trimmed, Vec::new())];
    if let Some(body) = fenced_body(trimmed) {
        candidates.push((body, vec![Repair::StrippedFence]));
    }
    if let Some(span) = balanced_span(trimmed) {
        if span.len() != trimmed.len() {
            candidates.push((span, vec![Repair::ExtractedSpan]));
        }
    }

    let mut first_error: Option<String> = None;
    for (candidate, base_repairs) in candidates {
        match decode_candidate(candidate) {
            Ok((value, mut repairs)) => {
                let mut all = base_repairs;
                all.append(&mut repairs);
                if !all.is_empty() {
                    debug!(repairs = ?all, "Decoded structured output after repair");
                }
                return Ok(Decoded {
                    value,
                    repairs: all,
                });
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    Err(DecodeError::Unparseable {
        reason: first_error.unwrap_or_else(|| "no JSON found".to_string()),
        raw: text.to_string(),
    })
}

/// Decode like [`decode`], but only accept a JSON object.
///
/// # Errors
///
/// As [`decode`], plus [`DecodeError::Unparseable`] when the value is not an object.
pub fn decode_object(text: &str) -> Result<Decoded, DecodeError> {
    let decoded = decode(text)?;
    if decoded.value.is_object() {
        Ok(decoded)
    } else {
        Err(DecodeError::Unparseable {
            reason: format!("expected a JSON object, found {}", kind_of(&decoded.value)),
            raw: text.to_string(),
        })
    }
}

fn decode_candidate(candidate: &str) -> Result<(Value, Vec<Repair>), String> {
    let first_error = match serde_json::from_str::<Value>(candidate) {
        Ok(value) => return Ok((value, Vec::new())),
        Err(e) => e.to_string(),
    };

    let mut repairs = Vec::new();
    let mut working = candidate.to_string();

    let escaped = escape_control_chars_in_strings(&working);
    if escaped != working {
        repairs.push(Repair::EscapedControlChars);
        working = escaped;
        if let Ok(value) = serde_json::from_str::<Value>(&working) {
            return Ok((value, repairs));
        }
    }

    let without_commas = remove_trailing_commas(&working);
    if without_commas != working {
        repairs.push(Repair::RemovedTrailingCommas);
        if let Ok(value) = serde_json::from_str::<Value>(&without_commas) {
            return Ok((value, repairs));
        }
    }

    Err(first_error)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
