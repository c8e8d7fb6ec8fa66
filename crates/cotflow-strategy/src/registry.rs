use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cotflow_prompt_template::placeholders;
use cotflow_utils::error::StrategyError;

use crate::builtin;
use crate::model::{AdapterRule, ExecuteBehavior, PhaseStrategy, StepSpec};

/// On-disk pipeline definition: `[[phases]]` entries plus `[[adapters]]` rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    pub phases: Vec<PhaseStrategy>,
    #[serde(default)]
    pub adapters: Vec<AdapterRule>,
}

/// Read-only table of phase strategies keyed by phase number.
///
/// Built once at startup and validated on construction, so lookups never
/// fail for a phase in `1..=phase_count()`.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    phases: Vec<PhaseStrategy>,
    adapters: Vec<AdapterRule>,
}

impl StrategyRegistry {
    /// # Errors
    ///
    /// Returns a `StrategyError` if phases are missing, not numbered
    /// contiguously from 1, or any phase or adapter entry is invalid.
    pub fn new(
        mut phases: Vec<PhaseStrategy>,
        adapters: Vec<AdapterRule>,
    ) -> Result<Self, StrategyError> {
        phases.sort_by_key(|p| p.phase);
        validate_numbering(&phases)?;
        for phase in &phases {
            validate_phase(phase)?;
        }
        let count = u32::try_from(phases.len()).unwrap_or(u32::MAX);
        for (index, rule) in adapters.iter().enumerate() {
            validate_adapter(index, rule, count)?;
        }
        Ok(Self { phases, adapters })
    }

    /// The neutral research / concepts / drafts pipeline.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            phases: builtin::phases(),
            adapters: builtin::adapters(),
        }
    }

    /// # Errors
    ///
    /// Returns `StrategyError::Load` if the text is not a valid pipeline
    /// document, or a validation error from [`StrategyRegistry::new`].
    pub fn from_toml_str(text: &str) -> Result<Self, StrategyError> {
        let file: PipelineFile = toml::from_str(text).map_err(|e| StrategyError::Load {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        Self::new(file.phases, file.adapters)
    }

    /// Load a pipeline file.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::Load` if the file cannot be read or parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, StrategyError> {
        let text = std::fs::read_to_string(path).map_err(|e| StrategyError::Load {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let file: PipelineFile = toml::from_str(&text).map_err(|e| StrategyError::Load {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let registry = Self::new(file.phases, file.adapters)?;
        debug!(
            path = %path,
            phases = registry.phase_count(),
            adapters = registry.adapters.len(),
            "Loaded pipeline"
        );
        Ok(registry)
    }

    #[must_use]
    pub fn get(&self, phase: u32) -> Option<&PhaseStrategy> {
        let idx = usize::try_from(phase).ok()?.checked_sub(1)?;
        self.phases.get(idx)
    }

    /// Number of phases, P.
    #[must_use]
    pub fn phase_count(&self) -> u32 {
        u32::try_from(self.phases.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn is_last(&self, phase: u32) -> bool {
        phase == self.phase_count()
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhaseStrategy> {
        self.phases.iter()
    }

    #[must_use]
    pub fn adapters(&self) -> &[AdapterRule] {
        &self.adapters
    }

    /// Adapter rules feeding the context of `target_phase`, in declaration order.
    pub fn adapters_for(&self, target_phase: u32) -> impl Iterator<Item = &AdapterRule> {
        self.adapters
            .iter()
            .filter(move |rule| rule.applies_to(target_phase))
    }

    /// Serialize back to the pipeline file format.
    ///
    /// # Errors
    ///
    /// Returns `StrategyError::Load` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, StrategyError> {
        let file = PipelineFile {
            phases: self.phases.clone(),
            adapters: self.adapters.clone(),
        };
        toml::to_string_pretty(&file).map_err(|e| StrategyError::Load {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }
}

fn validate_numbering(phases: &[PhaseStrategy]) -> Result<(), StrategyError> {
    if phases.is_empty() {
        return Err(StrategyError::Empty);
    }
    let contiguous = phases
        .iter()
        .enumerate()
        .all(|(i, p)| usize::try_from(p.phase).ok() == Some(i + 1));
    if !contiguous {
        return Err(StrategyError::NonContiguous {
            found: phases.iter().map(|p| p.phase).collect(),
        });
    }
    Ok(())
}

fn validate_phase(phase: &PhaseStrategy) -> Result<(), StrategyError> {
    let invalid = |reason: String| StrategyError::InvalidPhase {
        phase: phase.phase,
        reason,
    };

    validate_step("think", &phase.think).map_err(invalid)?;
    validate_step("integrate", &phase.integrate).map_err(invalid)?;

    if let ExecuteBehavior::SearchFanOut(fan_out) = &phase.execute {
        if fan_out.source_field.trim().is_empty() {
            return Err(invalid("execute.source_field must not be empty".to_string()));
        }
        if fan_out.query_key.trim().is_empty() {
            return Err(invalid("execute.query_key must not be empty".to_string()));
        }
        if fan_out.max_queries == Some(0) {
            return Err(invalid("execute.max_queries must be greater than 0".to_string()));
        }
    }
    Ok(())
}

fn validate_step(label: &str, step: &StepSpec) -> Result<(), String> {
    if step.prompt.trim().is_empty() {
        return Err(format!("{label}.prompt must not be empty"));
    }
    if !(0.0..=2.0).contains(&step.temperature) {
        return Err(format!(
            "{label}.temperature must be between 0.0 and 2.0, got {}",
            step.temperature
        ));
    }
    if step.max_tokens == 0 {
        return Err(format!("{label}.max_tokens must be greater than 0"));
    }

    let mut named = placeholders(&step.prompt);
    if let Some(system) = &step.system {
        named.extend(placeholders(system));
    }
    if let Some(var) = step.requires.iter().find(|v| !named.contains(v)) {
        return Err(format!(
            "{label}.requires names '{var}' but the prompt has no {{{var}}} placeholder"
        ));
    }
    Ok(())
}

fn validate_adapter(
    index: usize,
    rule: &AdapterRule,
    phase_count: u32,
) -> Result<(), StrategyError> {
    let invalid = |reason: String| StrategyError::InvalidAdapter { index, reason };

    if rule.source_phase == 0 || rule.source_phase >= phase_count {
        return Err(invalid(format!(
            "source_phase {} must be between 1 and {}",
            rule.source_phase,
            phase_count.saturating_sub(1)
        )));
    }
    if rule.from_field.trim().is_empty() || rule.to_var.trim().is_empty() {
        return Err(invalid("from_field and to_var must not be empty".to_string()));
    }
    if let (Some(from), Some(to)) = (rule.target_from, rule.target_to)
        && from > to
    {
        return Err(invalid(format!("target_from {from} is after target_to {to}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FanOut;

    fn phase(n: u32) -> PhaseStrategy {
        PhaseStrategy {
            phase: n,
            name: String::new(),
            think: StepSpec::new("think {topic}"),
            execute: ExecuteBehavior::PassThrough,
            integrate: StepSpec::new("integrate"),
        }
    }

    #[test]
    fn test_builtin_is_valid() {
        let builtin = StrategyRegistry::builtin();
        let phases: Vec<_> = builtin.phases().cloned().collect();
        let rebuilt = StrategyRegistry::new(phases, builtin.adapters().to_vec()).unwrap();
        assert_eq!(rebuilt.phase_count(), 3);
        assert!(matches!(
            rebuilt.get(1).unwrap().execute,
            ExecuteBehavior::SearchFanOut(_)
        ));
        assert!(rebuilt.is_last(3));
    }

    #[test]
    fn test_get_out_of_range() {
        let registry = StrategyRegistry::builtin();
        assert!(registry.get(0).is_none());
        assert!(registry.get(4).is_none());
        assert_eq!(registry.get(2).unwrap().phase, 2);
    }

    #[test]
    fn test_phases_sorted_before_validation() {
        let registry = StrategyRegistry::new(vec![phase(2), phase(1)], vec![]).unwrap();
        assert_eq!(registry.get(1).unwrap().phase, 1);
    }

    #[test]
    fn test_rejects_empty_and_gaps() {
        assert!(matches!(
            StrategyRegistry::new(vec![], vec![]),
            Err(StrategyError::Empty)
        ));
        let err = StrategyRegistry::new(vec![phase(1), phase(3)], vec![]).unwrap_err();
        assert!(matches!(err, StrategyError::NonContiguous { ref found } if found == &[1, 3]));
        let err = StrategyRegistry::new(vec![phase(1), phase(1)], vec![]).unwrap_err();
        assert!(matches!(err, StrategyError::NonContiguous { .. }));
    }

    #[test]
    fn test_rejects_requires_without_placeholder() {
        let mut p = phase(1);
        p.think = p.think.requiring(&["audience"]);
        let err = StrategyRegistry::new(vec![p], vec![]).unwrap_err();
        assert!(matches!(
            err,
            StrategyError::InvalidPhase { phase: 1, ref reason } if reason.contains("audience")
        ));
    }

    #[test]
    fn test_rejects_empty_fan_out_source() {
        let mut p = phase(1);
        p.execute = ExecuteBehavior::SearchFanOut(FanOut::new("", "query"));
        assert!(StrategyRegistry::new(vec![p], vec![]).is_err());
    }

    #[test]
    fn test_rejects_adapter_from_last_phase() {
        let err = StrategyRegistry::new(
            vec![phase(1), phase(2)],
            vec![AdapterRule::new(2, "a", "b")],
        )
        .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidAdapter { index: 0, .. }));
    }

    #[test]
    fn test_adapters_for_target() {
        let registry = StrategyRegistry::new(
            vec![phase(1), phase(2), phase(3)],
            vec![
                AdapterRule::new(1, "trendedTopics", "opportunities"),
                AdapterRule::new(2, "concepts", "ideas").only_for(3),
            ],
        )
        .unwrap();
        let for_2: Vec<_> = registry.adapters_for(2).map(|r| r.to_var.as_str()).collect();
        assert_eq!(for_2, vec!["opportunities"]);
        let for_3: Vec<_> = registry.adapters_for(3).map(|r| r.to_var.as_str()).collect();
        assert_eq!(for_3, vec!["opportunities", "ideas"]);
    }

    #[test]
    fn test_from_toml_str() {
        let registry = StrategyRegistry::from_toml_str(
            r#"
            [[phases]]
            phase = 1
            name = "gather"
            [phases.think]
            prompt = "List queries about {topic}"
            requires = ["topic"]
            [phases.execute]
            handler = "search_fan_out"
            source_field = "opportunities"
            query_key = "q"
            [phases.integrate]
            prompt = "Summarize {searchResults}"

            [[phases]]
            phase = 2
            [phases.think]
            prompt = "Use {opportunities}"
            [phases.integrate]
            prompt = "Done"

            [[adapters]]
            source_phase = 1
            from_field = "trendedTopics"
            to_var = "opportunities"
            "#,
        )
        .unwrap();
        assert_eq!(registry.phase_count(), 2);
        assert_eq!(registry.get(1).unwrap().label(), "phase 1 (gather)");
        assert_eq!(registry.adapters().len(), 1);
    }

    #[test]
    fn test_toml_round_trip_of_builtin() {
        let text = StrategyRegistry::builtin().to_toml_string().unwrap();
        let back = StrategyRegistry::from_toml_str(&text).unwrap();
        assert_eq!(back.phase_count(), 3);
        assert_eq!(back.get(1), StrategyRegistry::builtin().get(1));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("nope.toml")).unwrap();
        let err = StrategyRegistry::load(&path).unwrap_err();
        assert!(matches!(err, StrategyError::Load { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("p.toml")).unwrap();
        std::fs::write(
            &path,
            "[[phases]]\nphase = 1\n[phases.think]\nprompt = \"a\"\n[phases.integrate]\nprompt = \"b\"\n",
        )
        .unwrap();
        assert_eq!(StrategyRegistry::load(&path).unwrap().phase_count(), 1);
    }
}
