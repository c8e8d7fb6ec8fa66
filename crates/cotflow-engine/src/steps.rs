//! Pure helpers shared by `advance` and the debug harness.

use serde_json::{Value, json};

use cotflow_llm::{CompletionRequest, SearchRequest};
use cotflow_prompt_template::render;
use cotflow_store::TaskRecord;
use cotflow_strategy::{FanOut, StepSpec};
use cotflow_utils::types::TaskStatus;

use crate::context::Context;
use crate::dispatcher::BatchStatus;

/// Prompt and system text of a completion step after rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStep {
    pub prompt: String,
    pub system: Option<String>,
}

#[must_use]
pub fn render_step(spec: &StepSpec, ctx: &Context) -> RenderedStep {
    RenderedStep {
        prompt: render(&spec.prompt, ctx),
        system: spec.system.as_deref().map(|s| render(s, ctx)),
    }
}

/// Structured-output request for a rendered THINK or INTEGRATE step.
#[must_use]
pub fn completion_request(spec: &StepSpec, rendered: &RenderedStep) -> CompletionRequest {
    let mut request = CompletionRequest::from_prompt(rendered.system.as_deref(), &rendered.prompt);
    request.model = spec.model.clone();
    request.temperature = Some(spec.temperature);
    request.max_tokens = Some(spec.max_tokens);
    request.structured_output = true;
    request
}

/// Queries named by a fan-out rule in a THINK result.
///
/// String entries are taken as-is, object entries through `query_key`.
/// Blank entries are skipped; `max_queries` truncates.
#[must_use]
pub fn extract_queries(think_result: Option<&Value>, fan: &FanOut) -> Vec<String> {
    let Some(Value::Array(entries)) = think_result.and_then(|v| v.get(&fan.source_field)) else {
        return Vec::new();
    };

    let queries = entries.iter().filter_map(|entry| {
        let text = match entry {
            Value::String(s) => s.as_str(),
            Value::Object(fields) => fields.get(&fan.query_key)?.as_str()?,
            _ => return None,
        };
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    });

    match fan.max_queries {
        Some(limit) => queries.take(limit).collect(),
        None => queries.collect(),
    }
}

/// One search request per query, sharing the rendered system instruction.
#[must_use]
pub fn search_requests(fan: &FanOut, queries: &[String], ctx: &Context) -> Vec<SearchRequest> {
    let system_instruction = fan.system_instruction.as_deref().map(|t| render(t, ctx));
    queries
        .iter()
        .map(|query| SearchRequest {
            query: query.clone(),
            system_instruction: system_instruction.clone(),
        })
        .collect()
}

/// Marker recorded as the EXECUTE result of a pass-through phase.
#[must_use]
pub fn pass_through_result() -> Value {
    json!({ "passThrough": true })
}

/// EXECUTE result of a settled search batch.
#[must_use]
pub fn execute_result(batch: &BatchStatus) -> Value {
    let mut results = Vec::new();
    let mut failed = Vec::new();
    for task in &batch.results {
        match task.status {
            TaskStatus::Done => results.push(task.result.clone().unwrap_or(Value::Null)),
            _ => failed.push(json!({
                "query": task.request.get("query").cloned().unwrap_or(Value::Null),
                "error": task.error.clone().unwrap_or_default(),
            })),
        }
    }
    json!({ "searchResults": results, "failedSearches": failed })
}

/// Decoded value a completion task produced.
#[must_use]
pub fn completion_value(task: &TaskRecord) -> Value {
    task.result
        .as_ref()
        .and_then(|r| r.get("value"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Total tokens reported in a task result, if the backend reported usage.
#[must_use]
pub fn token_total(result: &Value) -> Option<u64> {
    let usage = result.get("usage")?;
    let input = usage.get("input")?.as_u64()?;
    let output = usage.get("output")?.as_u64()?;
    Some(input + output)
}

/// Wall time from the first task created to the last one finished.
#[must_use]
pub fn batch_duration_ms(batch: &BatchStatus) -> Option<u64> {
    let start = batch.results.iter().map(|t| t.created_at).min()?;
    let end = batch.results.iter().filter_map(|t| t.finished_at).max()?;
    u64::try_from(end.signed_duration_since(start).num_milliseconds()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_utils::test_support::object;
    use proptest::prelude::*;

    #[test]
    fn test_extract_queries_mixes_strings_and_objects() {
        let fan = FanOut::new("queries", "q");
        let think = json!({"queries": ["plain", {"q": "keyed"}, {"other": "x"}, "  ", 4]});
        assert_eq!(extract_queries(Some(&think), &fan), vec!["plain", "keyed"]);
    }

    #[test]
    fn test_extract_queries_truncates() {
        let mut fan = FanOut::new("queries", "query");
        fan.max_queries = Some(2);
        let think = json!({"queries": ["a", "b", "c"]});
        assert_eq!(extract_queries(Some(&think), &fan), vec!["a", "b"]);
    }

    #[test]
    fn test_extract_queries_missing_field_is_empty() {
        let fan = FanOut::new("queries", "query");
        assert!(extract_queries(Some(&json!({"other": []})), &fan).is_empty());
        assert!(extract_queries(None, &fan).is_empty());
        assert!(extract_queries(Some(&json!({"queries": "a"})), &fan).is_empty());
    }

    #[test]
    fn test_completion_request_carries_step_params() {
        let spec = StepSpec::new("Hi {name}")
            .with_system("sys {name}")
            .with_params(0.2, 99);
        let rendered = render_step(&spec, &object(json!({"name": "Sam"})));
        assert_eq!(rendered.prompt, "Hi Sam");
        assert_eq!(rendered.system.as_deref(), Some("sys Sam"));

        let req = completion_request(&spec, &rendered);
        assert!(req.structured_output);
        assert_eq!(req.temperature, Some(0.2));
        assert_eq!(req.max_tokens, Some(99));
        assert_eq!(req.last_user_content(), Some("Hi Sam"));
    }

    #[test]
    fn test_search_requests_share_instruction() {
        let mut fan = FanOut::new("queries", "query");
        fan.system_instruction = Some("About {topic}".into());
        let reqs = search_requests(
            &fan,
            &["a".to_string(), "b".to_string()],
            &object(json!({"topic": "X"})),
        );
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].query, "b");
        assert_eq!(reqs[1].system_instruction.as_deref(), Some("About X"));
    }

    proptest! {
        #[test]
        fn prop_extracted_queries_keep_order_and_limit(
            entries in prop::collection::vec("[a-z]{0,6}", 0..12),
            limit in prop::option::of(0usize..8),
        ) {
            let mut fan = FanOut::new("queries", "query");
            fan.max_queries = limit;
            let think = json!({ "queries": entries.clone() });
            let queries = extract_queries(Some(&think), &fan);

            let expected: Vec<String> = entries.into_iter().filter(|e| !e.is_empty()).collect();
            let expected = match limit {
                Some(n) => expected.into_iter().take(n).collect::<Vec<_>>(),
                None => expected,
            };
            prop_assert_eq!(queries, expected);
        }
    }

    #[test]
    fn test_token_total() {
        assert_eq!(token_total(&json!({"usage": {"input": 3, "output": 4}})), Some(7));
        assert_eq!(token_total(&json!({"usage": null})), None);
    }
}
