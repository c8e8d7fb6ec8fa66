//! Run a single step in isolation.
//!
//! The debug harness renders (and optionally executes) one `(phase, step)` of
//! an existing session against its persisted data, with any part of that
//! data overridden by mocks. It never moves the session and never writes
//! task rows. A dry run writes nothing at all.
//!
//! Saving a result goes through the session lease like `advance` does, and
//! is refused while the step is blocked or, for INTEGRATE, while the
//! previous phase has no integrate result.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use cotflow_prompt_template::{missing_placeholders, placeholders};
use cotflow_store::{Claim, PhaseRecord, SessionRecord};
use cotflow_strategy::{ExecuteBehavior, FanOut, StepSpec};
use cotflow_utils::error::{CotflowError, SessionError};
use cotflow_utils::types::{SessionId, SessionStatus, StepName};

use crate::context::{Context, build_step_context, missing_requirements};
use crate::dispatcher::TaskRequest;
use crate::orchestrator::{Orchestrator, invalid_state, next_holder};
use crate::steps;

const SKIPPED_ANSWER: &str = "[search skipped]";

/// Data that replaces persisted results for one debug run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MockData {
    /// Merged over the built context, winning on conflicts
    #[serde(default)]
    pub context: Option<Context>,
    /// Replaces the target phase's THINK result
    #[serde(default, alias = "thinkResult")]
    pub think_result: Option<Value>,
    /// Replaces the target phase's EXECUTE result
    #[serde(default, alias = "executeResult")]
    pub execute_result: Option<Value>,
    /// Answers used instead of calling search when `skip_search` is set
    #[serde(default, alias = "searchResults")]
    pub search_results: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    pub mock_data: Option<MockData>,
    /// Render only; no backend calls, no writes
    pub dry_run: bool,
    /// Write the step result to the phase row
    pub save_persisted: bool,
    /// Answer EXECUTE searches from mocks
    pub skip_search: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugRunResult {
    pub session_id: String,
    pub phase: u32,
    pub step: String,
    pub dry_run: bool,
    pub context_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub placeholders: Vec<String>,
    pub missing_placeholders: Vec<String>,
    pub missing_requirements: Vec<String>,
    pub planned_queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub persisted: bool,
}

/// Step runner bound to an orchestrator's store, registry and dispatcher.
#[derive(Clone)]
pub struct Debugger {
    orchestrator: Orchestrator,
}

impl Debugger {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// # Errors
    ///
    /// `SessionError::NotFound` or `SessionError::UnknownPhase`, or a store
    /// error. When saving: `SessionError::Blocked` for a step that cannot run
    /// yet, `SessionError::Busy` while another invocation holds the session,
    /// `SessionError::InvalidState` for a completed or cancelled session.
    /// Backend failures are reported in [`DebugRunResult::error`].
    pub async fn run_step(
        &self,
        id: &SessionId,
        phase: u32,
        step: StepName,
        options: DebugOptions,
    ) -> Result<DebugRunResult, CotflowError> {
        let store = self.orchestrator.store();
        let registry = self.orchestrator.registry();
        let session = store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        let strategy = registry
            .get(phase)
            .ok_or(SessionError::UnknownPhase { phase })?;
        let mock = options.mock_data.clone().unwrap_or_default();

        let mut phases = store.phases(id).await?;
        if mock.think_result.is_some() || mock.execute_result.is_some() {
            let pos = phases.iter().position(|p| p.phase == phase);
            let row = match pos {
                Some(i) => &mut phases[i],
                None => {
                    phases.push(PhaseRecord::new(id.clone(), phase));
                    let last = phases.len() - 1;
                    &mut phases[last]
                }
            };
            if let Some(think) = &mock.think_result {
                row.think_result = Some(think.clone());
            }
            if let Some(execute) = &mock.execute_result {
                row.execute_result = Some(execute.clone());
            }
        }

        let ctx = build_step_context(
            &session,
            &phases,
            registry,
            phase,
            step,
            mock.context.as_ref(),
        );

        let mut report = DebugRunResult {
            session_id: id.to_string(),
            phase,
            step: step.to_string(),
            dry_run: options.dry_run,
            context_keys: ctx.keys().cloned().collect(),
            ..DebugRunResult::default()
        };

        info!(
            session_id = %id,
            phase,
            step = %step,
            dry_run = options.dry_run,
            "Debug step run"
        );

        let saving = options.save_persisted && !options.dry_run;
        let lease = if saving {
            self.check_saveable(id, phase, step, strategy.completion_step(step), &ctx)
                .await?;
            Some(self.claim(id).await?)
        } else {
            None
        };

        let outcome = match (strategy.completion_step(step), &strategy.execute) {
            (Some(spec), _) => self.completion(spec, &ctx, &options, &mut report).await,
            (None, ExecuteBehavior::PassThrough) => {
                let marker = steps::pass_through_result();
                report.result = Some(marker.clone());
                (!options.dry_run).then_some(StepOutput::Execute(marker))
            }
            (None, ExecuteBehavior::SearchFanOut(fan)) => {
                let think = phases
                    .iter()
                    .find(|p| p.phase == phase)
                    .and_then(|p| p.think_result.as_ref());
                self.fan_out(fan, think, &ctx, &options, &mock, &mut report)
                    .await
            }
        };

        let Some((session, previous, holder)) = lease else {
            return Ok(report);
        };
        let saved = match outcome {
            Some(output) => self.write_phase_row(id, phase, step, output).await.map(|()| true),
            None => Ok(false),
        };
        let mut restored = session;
        restored.status = previous;
        if !store.commit_session(&restored, &holder).await? {
            warn!(session_id = %id, "Session lease lost during debug run");
        }
        report.persisted = saved?;
        Ok(report)
    }

    /// Refuse to save a step whose inputs are not there yet.
    async fn check_saveable(
        &self,
        id: &SessionId,
        phase: u32,
        step: StepName,
        spec: Option<&StepSpec>,
        ctx: &Context,
    ) -> Result<(), CotflowError> {
        let mut missing = spec
            .map(|spec| missing_requirements(&spec.requires, ctx))
            .unwrap_or_default();
        if step == StepName::Integrate && phase > 1 {
            let previous = self.orchestrator.store().get_phase(id, phase - 1).await?;
            if previous.and_then(|row| row.integrate_result).is_none() {
                missing.push(format!("phase {} integrate result", phase - 1));
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        Err(SessionError::Blocked {
            id: id.to_string(),
            phase,
            step: step.to_string(),
            missing,
        }
        .into())
    }

    /// Take the session lease for a saving run.
    async fn claim(
        &self,
        id: &SessionId,
    ) -> Result<(SessionRecord, SessionStatus, String), CotflowError> {
        let store = self.orchestrator.store();
        let holder = next_holder();
        match store
            .try_claim(id, &holder, self.orchestrator.lease_ttl())
            .await?
        {
            Claim::Acquired {
                session,
                previous_status,
            } => Ok((session, previous_status, holder)),
            Claim::Busy { holder } => Err(SessionError::Busy {
                id: id.to_string(),
                holder,
            }
            .into()),
            Claim::Closed(_) => {
                let current = store
                    .get_session(id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
                Err(invalid_state(&current, "save a debug result"))
            }
            Claim::NotFound => Err(SessionError::NotFound { id: id.to_string() }.into()),
        }
    }

    async fn write_phase_row(
        &self,
        id: &SessionId,
        phase: u32,
        step: StepName,
        output: StepOutput,
    ) -> Result<(), CotflowError> {
        let store = self.orchestrator.store();
        let mut row = store
            .get_phase(id, phase)
            .await?
            .unwrap_or_else(|| PhaseRecord::new(id.clone(), phase));
        let now = Utc::now();
        match output {
            StepOutput::Completion {
                value,
                prompt,
                tokens,
            } => {
                if step == StepName::Think {
                    row.think_prompt = Some(prompt);
                    row.think_result = Some(value);
                    row.think_tokens = tokens;
                    row.think_at = Some(now);
                } else {
                    row.integrate_prompt = Some(prompt);
                    row.integrate_result = Some(value);
                    row.integrate_tokens = tokens;
                    row.integrate_at = Some(now);
                }
            }
            StepOutput::Execute(value) => {
                row.execute_result = Some(value);
                row.execute_at = Some(now);
            }
        }
        row.updated_at = now;
        store.upsert_phase(&row).await?;
        Ok(())
    }

    async fn completion(
        &self,
        spec: &StepSpec,
        ctx: &Context,
        options: &DebugOptions,
        report: &mut DebugRunResult,
    ) -> Option<StepOutput> {
        let rendered = steps::render_step(spec, ctx);
        let mut names = placeholders(&spec.prompt);
        let mut missing = missing_placeholders(&spec.prompt, ctx);
        if let Some(system) = &spec.system {
            for name in placeholders(system) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            for name in missing_placeholders(system, ctx) {
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
        }
        report.placeholders = names;
        report.missing_placeholders = missing;
        report.missing_requirements = missing_requirements(&spec.requires, ctx);
        report.prompt = Some(rendered.prompt.clone());
        report.system = rendered.system.clone();

        if options.dry_run {
            return None;
        }

        let request = TaskRequest::Completion(steps::completion_request(spec, &rendered));
        match self.orchestrator.dispatcher().run_direct(&request).await {
            Ok(result) => {
                let value = result.get("value").cloned().unwrap_or(Value::Null);
                let tokens = steps::token_total(&result);
                report.result = Some(value.clone());
                Some(StepOutput::Completion {
                    value,
                    prompt: rendered.prompt,
                    tokens,
                })
            }
            Err(failure) => {
                report.result = failure.raw.clone().map(|raw| json!({ "raw": raw }));
                report.error = Some(failure.to_string());
                None
            }
        }
    }

    async fn fan_out(
        &self,
        fan: &FanOut,
        think: Option<&Value>,
        ctx: &Context,
        options: &DebugOptions,
        mock: &MockData,
        report: &mut DebugRunResult,
    ) -> Option<StepOutput> {
        let queries = steps::extract_queries(think, fan);
        let requests = steps::search_requests(fan, &queries, ctx);
        if let Some(instruction) = &fan.system_instruction {
            report.placeholders = placeholders(instruction);
            report.missing_placeholders = missing_placeholders(instruction, ctx);
        }
        report.system = requests.first().and_then(|r| r.system_instruction.clone());
        report.planned_queries = queries;

        if options.dry_run {
            return None;
        }

        let mut results = Vec::new();
        let mut failed = Vec::new();
        if options.skip_search {
            results = match &mock.search_results {
                Some(mocked) => mocked.clone(),
                None => requests
                    .iter()
                    .map(|r| json!({ "query": r.query, "answer": SKIPPED_ANSWER, "citations": [] }))
                    .collect(),
            };
        } else {
            let dispatcher = self.orchestrator.dispatcher();
            for request in requests {
                let query = request.query.clone();
                match dispatcher.run_direct(&TaskRequest::Search(request)).await {
                    Ok(result) => results.push(result),
                    Err(failure) => {
                        failed.push(json!({ "query": query, "error": failure.to_string() }));
                    }
                }
            }
        }

        let value = json!({ "searchResults": results, "failedSearches": failed });
        report.result = Some(value.clone());
        Some(StepOutput::Execute(value))
    }
}

enum StepOutput {
    Completion {
        value: Value,
        prompt: String,
        tokens: Option<u64>,
    },
    Execute(Value),
}
