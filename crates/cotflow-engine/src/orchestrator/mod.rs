//! Session state machine.
//!
//! A session walks `(phase, step)` from `(1, THINK)` through every phase's
//! THINK, EXECUTE and INTEGRATE, then becomes COMPLETED. Each call to
//! [`Orchestrator::advance`] claims the session lease, moves the session as
//! far as it can without waiting, and releases the lease in the same write
//! that records the new position. Waiting only ever happens on tasks: when a
//! step's tasks are still running, `advance` reports `NotReady` and returns.
//!
//! Results are written to the phase row before the session position moves
//! past them, so a crash between the two writes is repaired by the next
//! `advance` re-harvesting the same tasks.

mod handle;

pub use handle::OrchestratorHandle;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{Instrument, debug, info, warn};

use cotflow_store::{Claim, PhaseRecord, SessionRecord, Store, TaskRecord};
use cotflow_strategy::{ExecuteBehavior, FanOut, PhaseStrategy, StrategyRegistry};
use cotflow_utils::error::{CotflowError, SessionError};
use cotflow_utils::logging::{log_step_complete, log_step_dispatched, log_step_error, step_span};
use cotflow_utils::types::{PhaseStatus, SessionId, SessionStatus, StepName, TaskId, TaskStatus};
use serde_json::{Map, Value};

use crate::context::{build_step_context, missing_requirements};
use crate::dispatcher::{Dispatcher, TaskRequest, TaskSpec};
use crate::steps;

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lease holder id unique to one invocation.
pub(crate) fn next_holder() -> String {
    format!(
        "pid{}-{}",
        std::process::id(),
        HOLDER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// What one `advance` call achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Work was queued; advance again once it finishes
    Dispatched,
    /// The current step's tasks are not all terminal
    NotReady {
        pending: usize,
        done: usize,
        failed: usize,
    },
    /// The last phase's INTEGRATE was recorded
    Completed,
    /// A step failed; the session is FAILED until resumed
    Failed { reason: String },
    /// Required context variables are absent; nothing changed
    Blocked { missing: Vec<String> },
    /// Another invocation holds the session lease
    AlreadyExecuting { holder: String },
    /// The session is COMPLETED, FAILED or CANCELLED
    Terminal,
}

impl AdvanceOutcome {
    /// Whether advancing again can make progress without outside help.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Blocked { .. } | Self::Terminal
        )
    }
}

/// Position and outcome after an `advance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceReport {
    pub session_id: SessionId,
    pub phase: u32,
    pub step: StepName,
    pub status: SessionStatus,
    pub outcome: AdvanceOutcome,
    pub queued_task_ids: Vec<TaskId>,
}

impl AdvanceReport {
    fn new(session: &SessionRecord, outcome: AdvanceOutcome, queued: Vec<TaskId>) -> Self {
        Self {
            session_id: session.id.clone(),
            phase: session.current_phase,
            step: session.current_step,
            status: session.status,
            outcome,
            queued_task_ids: queued,
        }
    }
}

/// Task counts of one (phase, step, round) batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepTasks {
    pub phase: u32,
    pub step: StepName,
    pub round: u32,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// Everything known about a session.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session: SessionRecord,
    pub phase_count: u32,
    pub phases: Vec<PhaseRecord>,
    pub tasks: Vec<StepTasks>,
}

/// Outcome of running one step inside `advance`.
enum Progress {
    /// Position moved; keep going
    Moved,
    Stop(AdvanceOutcome, Vec<TaskId>),
}

/// Owns the store, the registry and the dispatcher, and moves sessions.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: Arc<StrategyRegistry>,
    dispatcher: Dispatcher,
    lease_ttl: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<StrategyRegistry>,
        dispatcher: Dispatcher,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(dispatcher.store()),
            registry,
            dispatcher,
            lease_ttl,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Create a session at phase 1, THINK.
    ///
    /// # Errors
    ///
    /// `SessionError::AlreadyExists` if `id` is taken, or a store error.
    pub async fn create_session(
        &self,
        config: Map<String, Value>,
        id: Option<SessionId>,
    ) -> Result<SessionRecord, CotflowError> {
        let id = id.unwrap_or_else(SessionId::generate);
        let record = SessionRecord::new(id.clone(), config);
        if !self.store.insert_session(&record).await? {
            return Err(SessionError::AlreadyExists { id: id.to_string() }.into());
        }
        info!(session_id = %id, phases = self.registry.phase_count(), "Session created");
        Ok(record)
    }

    async fn load(&self, id: &SessionId) -> Result<SessionRecord, CotflowError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() }.into())
    }

    /// # Errors
    ///
    /// `SessionError::NotFound`, or a store error.
    pub async fn status(&self, id: &SessionId) -> Result<StatusSnapshot, CotflowError> {
        let session = self.load(id).await?;
        let mut phases = self.store.phases(id).await?;
        phases.sort_by_key(|p| p.phase);

        let mut tasks: Vec<StepTasks> = Vec::new();
        for task in self.store.session_tasks(id).await? {
            let pos = tasks.iter().position(|t| {
                t.phase == task.phase && t.step == task.step && t.round == task.round
            });
            let entry = match pos {
                Some(i) => &mut tasks[i],
                None => {
                    tasks.push(StepTasks {
                        phase: task.phase,
                        step: task.step,
                        round: task.round,
                        pending: 0,
                        running: 0,
                        done: 0,
                        failed: 0,
                    });
                    let last = tasks.len() - 1;
                    &mut tasks[last]
                }
            };
            match task.status {
                TaskStatus::Pending => entry.pending += 1,
                TaskStatus::Running => entry.running += 1,
                TaskStatus::Done => entry.done += 1,
                TaskStatus::Failed => entry.failed += 1,
            }
        }

        Ok(StatusSnapshot {
            session,
            phase_count: self.registry.phase_count(),
            phases,
            tasks,
        })
    }

    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, CotflowError> {
        Ok(self.store.list_sessions().await?)
    }

    /// Mark a session CANCELLED and drop any lease on it.
    ///
    /// Tasks already running still record their results.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound`, `SessionError::InvalidState` for a completed
    /// session, or a store error.
    pub async fn cancel(&self, id: &SessionId) -> Result<SessionRecord, CotflowError> {
        let updated = self
            .store
            .update_session(
                id,
                Box::new(|s| {
                    if s.status != SessionStatus::Completed {
                        s.status = SessionStatus::Cancelled;
                        s.lease = None;
                    }
                }),
            )
            .await?
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;

        if updated.status == SessionStatus::Completed {
            return Err(invalid_state(&updated, "cancel"));
        }
        info!(session_id = %id, "Session cancelled");
        Ok(updated)
    }

    /// Make a failed or stuck session advanceable again.
    ///
    /// The session keeps its position; `round` is bumped so the current step
    /// dispatches fresh tasks, `last_error` is cleared and status becomes
    /// PENDING. A stale lease is taken over. An EXECUTING session only counts
    /// as stuck once every unfinished task of its current batch is older than
    /// the lease TTL.
    ///
    /// # Errors
    ///
    /// `SessionError::InvalidState` for completed or cancelled sessions, for
    /// sessions another invocation is advancing, and for sessions whose
    /// current tasks are still in flight; `SessionError::NotFound`; or a
    /// store error.
    pub async fn resume(&self, id: &SessionId) -> Result<SessionRecord, CotflowError> {
        let holder = next_holder();
        let claim = self.store.try_claim(id, &holder, self.lease_ttl).await?;
        let (mut session, previous) = match claim {
            Claim::NotFound => return Err(SessionError::NotFound { id: id.to_string() }.into()),
            Claim::Closed(_) => return Err(invalid_state(&self.load(id).await?, "resume")),
            Claim::Busy { .. } => return Err(invalid_state(&self.load(id).await?, "resume")),
            Claim::Acquired {
                session,
                previous_status,
            } => (session, previous_status),
        };

        if previous == SessionStatus::Executing
            && let Some(task) = self.in_flight_task(&session).await?
        {
            debug!(
                session_id = %id,
                task_id = %task.id,
                task_status = %task.status,
                "Current step still has live tasks; not resuming"
            );
            session.status = previous;
            self.store.commit_session(&session, &holder).await?;
            return Err(invalid_state(&session, "resume"));
        }

        if matches!(previous, SessionStatus::Failed | SessionStatus::Executing) {
            session.round += 1;
            session.last_error = None;
            session.status = SessionStatus::Pending;

            if let Some(mut row) = self.store.get_phase(id, session.current_phase).await? {
                row.status = PhaseStatus::for_step(session.current_step);
                row.updated_at = Utc::now();
                self.store.upsert_phase(&row).await?;
            }
            info!(
                session_id = %id,
                phase = session.current_phase,
                step = %session.current_step,
                round = session.round,
                "Session resumed"
            );
        } else {
            debug!(session_id = %id, status = %previous, "Nothing to resume");
            session.status = previous;
        }

        if !self.store.commit_session(&session, &holder).await? {
            return Err(invalid_state(&self.load(id).await?, "resume"));
        }
        self.load(id).await
    }

    /// A PENDING or RUNNING task of the current batch younger than the lease
    /// TTL. Older ones belong to a process that is presumed dead.
    async fn in_flight_task(
        &self,
        session: &SessionRecord,
    ) -> Result<Option<TaskRecord>, CotflowError> {
        let now = Utc::now();
        let batch = self
            .store
            .tasks_for(
                &session.id,
                session.current_phase,
                session.current_step,
                session.round,
            )
            .await?;
        Ok(batch.into_iter().find(|task| {
            let unfinished = matches!(task.status, TaskStatus::Pending | TaskStatus::Running);
            let since = task.started_at.unwrap_or(task.created_at);
            let young = now
                .signed_duration_since(since)
                .to_std()
                .map_or(true, |age| age <= self.lease_ttl);
            unfinished && young
        }))
    }

    /// Move the session forward as far as it can go without waiting.
    ///
    /// Domain outcomes (not ready, blocked, already executing, terminal,
    /// failed) are reported in the returned [`AdvanceReport`], not as errors.
    ///
    /// # Errors
    ///
    /// `SessionError::NotFound`, `SessionError::UnknownPhase`, or a store
    /// error. On error the lease is released and the session status restored.
    pub async fn advance(&self, id: &SessionId) -> Result<AdvanceReport, CotflowError> {
        let holder = next_holder();
        let claim = self.store.try_claim(id, &holder, self.lease_ttl).await?;
        let (session, previous) = match claim {
            Claim::NotFound => return Err(SessionError::NotFound { id: id.to_string() }.into()),
            Claim::Busy { holder } => {
                let current = self.load(id).await?;
                debug!(session_id = %id, holder = %holder, "Session already executing");
                return Ok(AdvanceReport::new(
                    &current,
                    AdvanceOutcome::AlreadyExecuting { holder },
                    Vec::new(),
                ));
            }
            Claim::Closed(_) => {
                let current = self.load(id).await?;
                return Ok(AdvanceReport::new(&current, AdvanceOutcome::Terminal, Vec::new()));
            }
            Claim::Acquired {
                session,
                previous_status,
            } => (session, previous_status),
        };

        if previous == SessionStatus::Failed {
            let mut restored = session;
            restored.status = SessionStatus::Failed;
            self.store.commit_session(&restored, &holder).await?;
            return Ok(AdvanceReport::new(&restored, AdvanceOutcome::Terminal, Vec::new()));
        }

        let span = step_span(
            id.as_str(),
            session.current_phase,
            session.current_step.as_str(),
        );
        let original = session.clone();
        let mut working = session;

        match self.run_steps(&mut working).instrument(span).await {
            Ok((outcome, queued)) => {
                working.status = settled_status(&outcome, working.status, previous);
                if !self.store.commit_session(&working, &holder).await? {
                    let current = self.load(id).await?;
                    warn!(
                        session_id = %id,
                        status = %current.status,
                        "Session lease lost during advance"
                    );
                    return Ok(AdvanceReport::new(&current, AdvanceOutcome::Terminal, queued));
                }
                Ok(AdvanceReport::new(&working, outcome, queued))
            }
            Err(e) => {
                let mut restored = original;
                restored.status = previous;
                if let Err(release) = self.store.commit_session(&restored, &holder).await {
                    warn!(session_id = %id, error = %release, "Could not release session lease");
                }
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        session: &mut SessionRecord,
    ) -> Result<(AdvanceOutcome, Vec<TaskId>), CotflowError> {
        loop {
            let phase = session.current_phase;
            let strategy = self
                .registry
                .get(phase)
                .ok_or(SessionError::UnknownPhase { phase })?;

            let progress = match session.current_step {
                StepName::Think | StepName::Integrate => {
                    self.completion_step(session, strategy).await?
                }
                StepName::Execute => self.execute_step(session, strategy).await?,
            };
            match progress {
                Progress::Moved => {}
                Progress::Stop(outcome, queued) => return Ok((outcome, queued)),
            }
        }
    }

    async fn phase_row(&self, session: &SessionRecord) -> Result<PhaseRecord, CotflowError> {
        Ok(self
            .store
            .get_phase(&session.id, session.current_phase)
            .await?
            .unwrap_or_else(|| PhaseRecord::new(session.id.clone(), session.current_phase)))
    }

    async fn completion_step(
        &self,
        session: &mut SessionRecord,
        strategy: &PhaseStrategy,
    ) -> Result<Progress, CotflowError> {
        let step = session.current_step;
        let phase = session.current_phase;
        let Some(spec) = strategy.completion_step(step) else {
            return Ok(Progress::Moved);
        };

        let batch = self
            .dispatcher
            .batch_status(&session.id, phase, step, session.round)
            .await?;

        if batch.is_empty() {
            let phases = self.store.phases(&session.id).await?;
            let ctx = build_step_context(session, &phases, &self.registry, phase, step, None);
            let missing = missing_requirements(&spec.requires, &ctx);
            if !missing.is_empty() {
                info!(
                    session_id = %session.id,
                    phase,
                    step = %step,
                    missing = ?missing,
                    "Step blocked"
                );
                return Ok(Progress::Stop(AdvanceOutcome::Blocked { missing }, Vec::new()));
            }

            let rendered = steps::render_step(spec, &ctx);
            let mut row = self.phase_row(session).await?;
            row.status = PhaseStatus::for_step(step);
            match step {
                StepName::Think => row.think_prompt = Some(rendered.prompt.clone()),
                _ => row.integrate_prompt = Some(rendered.prompt.clone()),
            }
            row.updated_at = Utc::now();
            self.store.upsert_phase(&row).await?;

            let task_id = self
                .dispatcher
                .queue_task(TaskSpec {
                    session_id: session.id.clone(),
                    phase,
                    step,
                    round: session.round,
                    index: 0,
                    request: TaskRequest::Completion(steps::completion_request(spec, &rendered)),
                })
                .await?;
            log_step_dispatched(session.id.as_str(), phase, step.as_str(), 1);
            return Ok(Progress::Stop(AdvanceOutcome::Dispatched, vec![task_id]));
        }

        if !batch.is_settled() {
            return Ok(Progress::Stop(not_ready(&batch), Vec::new()));
        }

        let Some(task) = batch.results.first() else {
            return Ok(Progress::Stop(not_ready(&batch), Vec::new()));
        };
        let mut row = self.phase_row(session).await?;
        let now = Utc::now();

        if task.status == TaskStatus::Failed {
            let reason = format!(
                "{} {} failed: {}",
                strategy.label(),
                step,
                task.error.as_deref().unwrap_or("unknown error")
            );
            return self.fail(session, row, reason).await;
        }

        let value = steps::completion_value(task);
        let tokens = task.result.as_ref().and_then(steps::token_total);
        match step {
            StepName::Think => {
                row.think_result = Some(value);
                row.think_tokens = tokens;
                row.think_at = Some(now);
                row.status = PhaseStatus::Executing;
            }
            _ => {
                row.integrate_result = Some(value);
                row.integrate_tokens = tokens;
                row.integrate_at = Some(now);
                row.status = PhaseStatus::Completed;
            }
        }
        row.updated_at = now;
        self.store.upsert_phase(&row).await?;
        session.last_completed_task = Some(task.id.clone());

        let duration_ms: u128 = match (task.started_at, task.finished_at) {
            (Some(start), Some(end)) => end
                .signed_duration_since(start)
                .num_milliseconds()
                .try_into()
                .unwrap_or(0),
            _ => 0,
        };
        log_step_complete(session.id.as_str(), phase, step.as_str(), duration_ms);

        Ok(self.transition(session))
    }

    async fn execute_step(
        &self,
        session: &mut SessionRecord,
        strategy: &PhaseStrategy,
    ) -> Result<Progress, CotflowError> {
        match &strategy.execute {
            ExecuteBehavior::PassThrough => {
                let mut row = self.phase_row(session).await?;
                self.record_execute(session, &mut row, steps::pass_through_result(), Some(0))
                    .await?;
                Ok(self.transition(session))
            }
            ExecuteBehavior::SearchFanOut(fan) => self.fan_out(session, strategy, fan).await,
        }
    }

    async fn fan_out(
        &self,
        session: &mut SessionRecord,
        strategy: &PhaseStrategy,
        fan: &FanOut,
    ) -> Result<Progress, CotflowError> {
        let phase = session.current_phase;
        let batch = self
            .dispatcher
            .batch_status(&session.id, phase, StepName::Execute, session.round)
            .await?;
        let mut row = self.phase_row(session).await?;

        if batch.is_empty() {
            let queries = steps::extract_queries(row.think_result.as_ref(), fan);
            if queries.is_empty() {
                info!(
                    session_id = %session.id,
                    phase,
                    field = %fan.source_field,
                    "No search queries; skipping fan-out"
                );
                self.record_execute(session, &mut row, steps::execute_result(&batch), Some(0))
                    .await?;
                return Ok(self.transition(session));
            }

            let phases = self.store.phases(&session.id).await?;
            let ctx = build_step_context(
                session,
                &phases,
                &self.registry,
                phase,
                StepName::Execute,
                None,
            );
            let specs = steps::search_requests(fan, &queries, &ctx)
                .into_iter()
                .zip(0u32..)
                .map(|(request, index)| TaskSpec {
                    session_id: session.id.clone(),
                    phase,
                    step: StepName::Execute,
                    round: session.round,
                    index,
                    request: TaskRequest::Search(request),
                })
                .collect();

            row.status = PhaseStatus::Executing;
            row.updated_at = Utc::now();
            self.store.upsert_phase(&row).await?;

            let ids = self.dispatcher.queue_batch(specs).await?;
            log_step_dispatched(session.id.as_str(), phase, StepName::Execute.as_str(), ids.len());
            return Ok(Progress::Stop(AdvanceOutcome::Dispatched, ids));
        }

        if !batch.is_settled() {
            return Ok(Progress::Stop(not_ready(&batch), Vec::new()));
        }

        if batch.done == 0 {
            let reason = format!(
                "{} EXECUTE failed: all {} searches failed",
                strategy.label(),
                batch.failed
            );
            return self.fail(session, row, reason).await;
        }
        if batch.failed > 0 {
            warn!(
                session_id = %session.id,
                phase,
                failed = batch.failed,
                done = batch.done,
                "Continuing with partial search results"
            );
        }

        let result = steps::execute_result(&batch);
        self.record_execute(session, &mut row, result, steps::batch_duration_ms(&batch))
            .await?;
        Ok(self.transition(session))
    }

    async fn record_execute(
        &self,
        session: &SessionRecord,
        row: &mut PhaseRecord,
        result: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), CotflowError> {
        let now = Utc::now();
        row.execute_result = Some(result);
        row.execute_duration_ms = duration_ms;
        row.execute_at = Some(now);
        row.status = PhaseStatus::Integrating;
        row.updated_at = now;
        self.store.upsert_phase(row).await?;
        log_step_complete(
            session.id.as_str(),
            session.current_phase,
            StepName::Execute.as_str(),
            u128::from(duration_ms.unwrap_or(0)),
        );
        Ok(())
    }

    async fn fail(
        &self,
        session: &mut SessionRecord,
        mut row: PhaseRecord,
        reason: String,
    ) -> Result<Progress, CotflowError> {
        row.status = PhaseStatus::Failed;
        row.updated_at = Utc::now();
        self.store.upsert_phase(&row).await?;

        log_step_error(
            session.id.as_str(),
            session.current_phase,
            session.current_step.as_str(),
            &reason,
        );
        session.last_error = Some(reason.clone());
        session.status = SessionStatus::Failed;
        Ok(Progress::Stop(AdvanceOutcome::Failed { reason }, Vec::new()))
    }

    /// Move past the step just recorded.
    fn transition(&self, session: &mut SessionRecord) -> Progress {
        if let Some(next) = session.current_step.next() {
            session.current_step = next;
            return Progress::Moved;
        }

        if self.registry.is_last(session.current_phase) {
            session.status = SessionStatus::Completed;
            session.completed_at = Some(Utc::now());
            info!(session_id = %session.id, "Session completed");
            return Progress::Stop(AdvanceOutcome::Completed, Vec::new());
        }

        session.current_phase += 1;
        session.current_step = StepName::Think;
        Progress::Moved
    }
}

fn not_ready(batch: &crate::dispatcher::BatchStatus) -> AdvanceOutcome {
    AdvanceOutcome::NotReady {
        pending: batch.pending + batch.running,
        done: batch.done,
        failed: batch.failed,
    }
}

/// Status written when `advance` releases the lease.
fn settled_status(
    outcome: &AdvanceOutcome,
    current: SessionStatus,
    previous: SessionStatus,
) -> SessionStatus {
    match outcome {
        AdvanceOutcome::Dispatched | AdvanceOutcome::NotReady { .. } => SessionStatus::Executing,
        AdvanceOutcome::Completed | AdvanceOutcome::Failed { .. } => current,
        _ => match previous {
            SessionStatus::Executing => SessionStatus::Pending,
            other => other,
        },
    }
}

pub(crate) fn invalid_state(session: &SessionRecord, operation: &str) -> CotflowError {
    SessionError::InvalidState {
        id: session.id.to_string(),
        status: session.status.to_string(),
        operation: operation.to_string(),
    }
    .into()
}
