use serde::{Deserialize, Serialize};

use cotflow_utils::types::StepName;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// THINK / EXECUTE / INTEGRATE behaviour for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseStrategy {
    pub phase: u32,
    #[serde(default)]
    pub name: String,
    pub think: StepSpec,
    #[serde(default)]
    pub execute: ExecuteBehavior,
    pub integrate: StepSpec,
}

impl PhaseStrategy {
    /// Completion step spec for THINK or INTEGRATE; `None` for EXECUTE.
    #[must_use]
    pub fn completion_step(&self, step: StepName) -> Option<&StepSpec> {
        match step {
            StepName::Think => Some(&self.think),
            StepName::Integrate => Some(&self.integrate),
            StepName::Execute => None,
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("phase {}", self.phase)
        } else {
            format!("phase {} ({})", self.phase, self.name)
        }
    }
}

/// A completion call: prompt template plus generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub prompt: String,
    /// System prompt, rendered against the same context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the configured completion model for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Context variables that must be present, or the step reports blocked
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

impl StepSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            model: None,
            requires: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn requiring(mut self, vars: &[&str]) -> Self {
        self.requires = vars.iter().map(|v| (*v).to_string()).collect();
        self
    }
}

/// What EXECUTE does for a phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum ExecuteBehavior {
    /// Visit EXECUTE and move straight on to INTEGRATE
    #[default]
    PassThrough,
    /// Queue one SEARCH task per query drawn from THINK's output
    SearchFanOut(FanOut),
}

/// Where fan-out queries come from in the THINK result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOut {
    /// Array field of the THINK result holding the queries
    pub source_field: String,
    /// Key to read from object entries; string entries are used as-is
    #[serde(default = "default_query_key")]
    pub query_key: String,
    /// System instruction template sent with every search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queries: Option<usize>,
}

fn default_query_key() -> String {
    "query".to_string()
}

impl FanOut {
    pub fn new(source_field: impl Into<String>, query_key: impl Into<String>) -> Self {
        Self {
            source_field: source_field.into(),
            query_key: query_key.into(),
            system_instruction: None,
            max_queries: None,
        }
    }
}

/// Which persisted result of the source phase an adapter reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterSource {
    #[default]
    Integrate,
    Execute,
}

/// Copies `from_field` of a source phase's result into context variable
/// `to_var` for every target phase in `[target_from, target_to]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterRule {
    pub source_phase: u32,
    #[serde(default)]
    pub source: AdapterSource,
    pub from_field: String,
    pub to_var: String,
    /// Defaults to `source_phase + 1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_from: Option<u32>,
    /// Unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_to: Option<u32>,
}

impl AdapterRule {
    pub fn new(
        source_phase: u32,
        from_field: impl Into<String>,
        to_var: impl Into<String>,
    ) -> Self {
        Self {
            source_phase,
            source: AdapterSource::Integrate,
            from_field: from_field.into(),
            to_var: to_var.into(),
            target_from: None,
            target_to: None,
        }
    }

    #[must_use]
    pub fn from_execute(mut self) -> Self {
        self.source = AdapterSource::Execute;
        self
    }

    #[must_use]
    pub fn only_for(mut self, target: u32) -> Self {
        self.target_from = Some(target);
        self.target_to = Some(target);
        self
    }

    /// Whether this rule feeds the context of `target_phase`.
    #[must_use]
    pub fn applies_to(&self, target_phase: u32) -> bool {
        let from = self.target_from.unwrap_or(self.source_phase + 1);
        target_phase >= from
            && self.target_to.is_none_or(|to| target_phase <= to)
            && self.source_phase < target_phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_default_range_is_all_later_phases() {
        let rule = AdapterRule::new(1, "trendedTopics", "opportunities");
        assert!(!rule.applies_to(1));
        assert!(rule.applies_to(2));
        assert!(rule.applies_to(7));
    }

    #[test]
    fn test_adapter_bounded_range() {
        let rule = AdapterRule::new(1, "a", "b").only_for(3);
        assert!(!rule.applies_to(2));
        assert!(rule.applies_to(3));
        assert!(!rule.applies_to(4));
    }

    #[test]
    fn test_adapter_never_reads_same_or_later_phase() {
        let mut rule = AdapterRule::new(3, "a", "b");
        rule.target_from = Some(1);
        assert!(!rule.applies_to(2));
        assert!(!rule.applies_to(3));
        assert!(rule.applies_to(4));
    }

    #[test]
    fn test_execute_behavior_toml_shape() {
        let parsed: PhaseStrategy = toml::from_str(
            r#"
            phase = 1
            [think]
            prompt = "plan {topic}"
            [execute]
            handler = "search_fan_out"
            source_field = "queries"
            [integrate]
            prompt = "merge {searchResults}"
            temperature = 0.2
            "#,
        )
        .unwrap();
        match parsed.execute {
            ExecuteBehavior::SearchFanOut(ref f) => {
                assert_eq!(f.source_field, "queries");
                assert_eq!(f.query_key, "query");
            }
            ExecuteBehavior::PassThrough => panic!("expected fan-out"),
        }
        assert_eq!(parsed.think.max_tokens, DEFAULT_MAX_TOKENS);
        assert!((parsed.integrate.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_execute_defaults_to_pass_through() {
        let parsed: PhaseStrategy = toml::from_str(
            r#"
            phase = 2
            [think]
            prompt = "t"
            [integrate]
            prompt = "i"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.execute, ExecuteBehavior::PassThrough);
        assert!(parsed.completion_step(StepName::Execute).is_none());
    }
}
