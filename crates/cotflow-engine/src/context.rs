//! Per-step context assembly.
//!
//! A context is the flat variable map a prompt template is rendered against.
//! It is rebuilt on every use and never persisted. Layers, later wins:
//!
//! 1. session config, plus the whole config as `session_config`
//! 2. top-level fields of each lower phase's integrate result (ascending),
//!    plus the whole result as `phase{N}Result`
//! 3. adapter rules targeting this phase
//! 4. for INTEGRATE only: this phase's think result, then execute result
//! 5. mock context (debug runs)

use serde_json::{Map, Value};

use cotflow_store::{PhaseRecord, SessionRecord};
use cotflow_strategy::{AdapterSource, StrategyRegistry};
use cotflow_utils::types::StepName;

pub type Context = Map<String, Value>;

/// Context for THINK (and for search instructions) of `target_phase`.
#[must_use]
pub fn build_context(
    session: &SessionRecord,
    phases: &[PhaseRecord],
    registry: &StrategyRegistry,
    target_phase: u32,
    mock_context: Option<&Context>,
) -> Context {
    let mut ctx = base_context(session, phases, registry, target_phase);
    apply_mock(&mut ctx, mock_context);
    ctx
}

/// Context for `step` of `phase`.
#[must_use]
pub fn build_step_context(
    session: &SessionRecord,
    phases: &[PhaseRecord],
    registry: &StrategyRegistry,
    phase: u32,
    step: StepName,
    mock_context: Option<&Context>,
) -> Context {
    let mut ctx = base_context(session, phases, registry, phase);

    if step != StepName::Think
        && let Some(current) = phases.iter().find(|p| p.phase == phase)
    {
        if let Some(think) = &current.think_result {
            merge_fields(&mut ctx, think);
            ctx.insert("thinkResult".to_string(), think.clone());
        }
        if step == StepName::Integrate
            && let Some(execute) = &current.execute_result
        {
            merge_fields(&mut ctx, execute);
            ctx.insert("executeResult".to_string(), execute.clone());
        }
    }

    apply_mock(&mut ctx, mock_context);
    ctx
}

fn base_context(
    session: &SessionRecord,
    phases: &[PhaseRecord],
    registry: &StrategyRegistry,
    target_phase: u32,
) -> Context {
    let mut ctx = session.config.clone();
    ctx.insert(
        "session_config".to_string(),
        Value::Object(session.config.clone()),
    );

    let mut earlier: Vec<&PhaseRecord> = phases.iter().filter(|p| p.phase < target_phase).collect();
    earlier.sort_by_key(|p| p.phase);
    for row in &earlier {
        if let Some(result) = &row.integrate_result {
            merge_fields(&mut ctx, result);
            ctx.insert(format!("phase{}Result", row.phase), result.clone());
        }
    }

    for rule in registry.adapters_for(target_phase) {
        let source = earlier
            .iter()
            .find(|p| p.phase == rule.source_phase)
            .and_then(|p| match rule.source {
                AdapterSource::Integrate => p.integrate_result.as_ref(),
                AdapterSource::Execute => p.execute_result.as_ref(),
            })
            .and_then(|result| result.get(&rule.from_field));
        if let Some(value) = source {
            ctx.insert(rule.to_var.clone(), value.clone());
        }
    }

    ctx
}

fn merge_fields(ctx: &mut Context, value: &Value) {
    if let Value::Object(fields) = value {
        for (k, v) in fields {
            ctx.insert(k.clone(), v.clone());
        }
    }
}

fn apply_mock(ctx: &mut Context, mock_context: Option<&Context>) {
    if let Some(mock) = mock_context {
        for (k, v) in mock {
            ctx.insert(k.clone(), v.clone());
        }
    }
}

/// Required variables absent from `ctx`.
#[must_use]
pub fn missing_requirements(requires: &[String], ctx: &Context) -> Vec<String> {
    requires
        .iter()
        .filter(|name| ctx.get(name.as_str()).is_none_or(Value::is_null))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_strategy::{AdapterRule, ExecuteBehavior, PhaseStrategy, StepSpec};
    use cotflow_utils::test_support::{object, session_id};
    use serde_json::json;

    fn registry(adapters: Vec<AdapterRule>) -> StrategyRegistry {
        let phase = |n| PhaseStrategy {
            phase: n,
            name: String::new(),
            think: StepSpec::new("t"),
            execute: ExecuteBehavior::PassThrough,
            integrate: StepSpec::new("i"),
        };
        StrategyRegistry::new(vec![phase(1), phase(2), phase(3)], adapters).unwrap()
    }

    fn session() -> SessionRecord {
        SessionRecord::new(session_id("ctx"), object(json!({"topic": "X"})))
    }

    fn row(phase: u32, integrate: Value) -> PhaseRecord {
        let mut r = PhaseRecord::new(session_id("ctx"), phase);
        r.integrate_result = Some(integrate);
        r
    }

    #[test]
    fn test_adapter_remaps_earlier_output() {
        let reg = registry(vec![AdapterRule::new(1, "trendedTopics", "opportunities")]);
        let phases = vec![
            row(1, json!({"trendedTopics": ["A", "B"]})),
            row(2, json!({"concepts": ["X"]})),
        ];
        let ctx = build_context(&session(), &phases, &reg, 3, None);
        assert_eq!(ctx["opportunities"], json!(["A", "B"]));
        assert_eq!(ctx["concepts"], json!(["X"]));
        assert_eq!(ctx["topic"], json!("X"));
        assert_eq!(ctx["phase2Result"], json!({"concepts": ["X"]}));
        assert_eq!(ctx["session_config"], json!({"topic": "X"}));
    }

    #[test]
    fn test_same_and_later_phases_are_invisible() {
        let reg = registry(vec![]);
        let phases = vec![row(2, json!({"late": 1})), row(3, json!({"later": 1}))];
        let ctx = build_context(&session(), &phases, &reg, 2, None);
        assert!(!ctx.contains_key("late"));
        assert!(!ctx.contains_key("later"));
    }

    #[test]
    fn test_missing_adapter_source_leaves_var_absent() {
        let reg = registry(vec![AdapterRule::new(1, "trendedTopics", "opportunities")]);
        let ctx = build_context(&session(), &[row(1, json!({"other": 1}))], &reg, 2, None);
        assert!(!ctx.contains_key("opportunities"));
        assert_eq!(
            missing_requirements(&["opportunities".to_string()], &ctx),
            vec!["opportunities".to_string()]
        );
    }

    #[test]
    fn test_execute_sourced_adapter() {
        let reg = registry(vec![
            AdapterRule::new(1, "searchResults", "sources").from_execute(),
        ]);
        let mut r = row(1, json!({}));
        r.execute_result = Some(json!({"searchResults": [{"query": "q"}]}));
        let ctx = build_context(&session(), &[r], &reg, 2, None);
        assert_eq!(ctx["sources"], json!([{"query": "q"}]));
    }

    #[test]
    fn test_mock_context_wins() {
        let reg = registry(vec![AdapterRule::new(1, "trendedTopics", "opportunities")]);
        let mock = object(json!({"opportunities": ["M"], "topic": "Y"}));
        let ctx = build_context(
            &session(),
            &[row(1, json!({"trendedTopics": ["A"]}))],
            &reg,
            2,
            Some(&mock),
        );
        assert_eq!(ctx["opportunities"], json!(["M"]));
        assert_eq!(ctx["topic"], json!("Y"));
    }

    #[test]
    fn test_integrate_context_merges_think_then_execute() {
        let reg = registry(vec![]);
        let mut current = PhaseRecord::new(session_id("ctx"), 1);
        current.think_result = Some(json!({"queries": ["q"], "shared": "think"}));
        current.execute_result = Some(json!({"searchResults": [], "shared": "execute"}));
        let phases = vec![current];

        let ctx = build_step_context(&session(), &phases, &reg, 1, StepName::Integrate, None);
        assert_eq!(ctx["queries"], json!(["q"]));
        assert_eq!(ctx["shared"], json!("execute"));
        assert!(ctx.contains_key("executeResult"));

        let think_ctx = build_step_context(&session(), &phases, &reg, 1, StepName::Think, None);
        assert!(!think_ctx.contains_key("queries"));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let ctx = object(json!({"a": null, "b": 0}));
        let missing = missing_requirements(&["a".into(), "b".into(), "c".into()], &ctx);
        assert_eq!(missing, vec!["a".to_string(), "c".to_string()]);
    }
}
