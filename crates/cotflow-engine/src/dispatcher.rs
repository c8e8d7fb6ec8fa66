//! In-process task queue.
//!
//! `queue_task` writes a PENDING row and spawns a tokio worker. Workers share
//! one semaphore, so at most `max_concurrency` backend calls are in flight
//! across all sessions. Every terminal write is announced on a broadcast
//! channel; the driver listens there, and `advance` can always poll instead.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cotflow_config::DispatchSettings;
use cotflow_extraction::decode_object;
use cotflow_llm::{CompletionBackend, CompletionRequest, SearchBackend, SearchRequest};
use cotflow_store::{Store, TaskRecord};
use cotflow_utils::error::{DecodeError, LlmError, StoreError};
use cotflow_utils::redaction::redact_secrets;
use cotflow_utils::types::{SessionId, StepName, TaskId, TaskStatus, TaskType};

const EVENT_CAPACITY: usize = 256;

/// Work sent to a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    Completion(CompletionRequest),
    Search(SearchRequest),
}

impl TaskRequest {
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::Completion(_) => TaskType::Completion,
            Self::Search(_) => TaskType::Search,
        }
    }

    fn to_value(&self) -> Value {
        let serialized = match self {
            Self::Completion(req) => serde_json::to_value(req),
            Self::Search(req) => serde_json::to_value(req),
        };
        serialized.unwrap_or(Value::Null)
    }
}

/// One task to queue. `(session_id, phase, step, round, index)` is its identity.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub session_id: SessionId,
    pub phase: u32,
    pub step: StepName,
    pub round: u32,
    pub index: u32,
    pub request: TaskRequest,
}

impl TaskSpec {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        TaskId::derive(&self.session_id, self.phase, self.step, self.round, self.index)
    }
}

/// Announcement of a terminal task write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCompletion {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub phase: u32,
    pub step: StepName,
    pub status: TaskStatus,
}

/// Counts and rows of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStatus {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    /// Rows ordered by index
    pub results: Vec<TaskRecord>,
}

impl BatchStatus {
    fn from_tasks(tasks: Vec<TaskRecord>) -> Self {
        let mut status = Self::default();
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Running => status.running += 1,
                TaskStatus::Done => status.done += 1,
                TaskStatus::Failed => status.failed += 1,
            }
        }
        status.results = tasks;
        status
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Every task has reached DONE or FAILED.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Why a task ended FAILED.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    /// Verbatim model output when structured decoding gave up
    pub raw: Option<String>,
    pub attempts: u32,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.message, self.attempts)
    }
}

enum AttemptError {
    Llm(LlmError),
    Decode(DecodeError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_transient(),
            Self::Decode(_) => true,
        }
    }

    fn into_failure(self, attempts: u32) -> TaskFailure {
        match self {
            Self::Llm(e) => TaskFailure {
                message: redact_secrets(&e.to_string()),
                raw: None,
                attempts,
            },
            Self::Decode(e) => TaskFailure {
                message: e.to_string(),
                raw: Some(e.raw().to_string()).filter(|r| !r.is_empty()),
                attempts,
            },
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    completion: Arc<dyn CompletionBackend>,
    search: Arc<dyn SearchBackend>,
    settings: DispatchSettings,
    permits: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    events: broadcast::Sender<TaskCompletion>,
}

/// Queues tasks and runs them on background workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        completion: Arc<dyn CompletionBackend>,
        search: Arc<dyn SearchBackend>,
        settings: DispatchSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                completion,
                search,
                settings,
                permits,
                workers: Mutex::new(JoinSet::new()),
                events,
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    #[must_use]
    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }

    /// Receive a [`TaskCompletion`] for every task that reaches DONE or FAILED.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskCompletion> {
        self.inner.events.subscribe()
    }

    /// Queue one task and return its id.
    ///
    /// A task whose row already exists is not dispatched again.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` if the PENDING row cannot be written.
    pub async fn queue_task(&self, spec: TaskSpec) -> Result<TaskId, StoreError> {
        let id = spec.task_id();
        if let Some(existing) = self.inner.store.get_task(&spec.session_id, &id).await? {
            debug!(task_id = %id, status = %existing.status.as_str(), "Task already queued");
            return Ok(id);
        }

        let record = TaskRecord {
            id: id.clone(),
            session_id: spec.session_id.clone(),
            phase: spec.phase,
            step: spec.step,
            task_type: spec.request.task_type(),
            round: spec.round,
            index: spec.index,
            request: spec.request.to_value(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.inner.store.upsert_task(&record).await?;

        info!(
            session_id = %spec.session_id,
            phase = spec.phase,
            step = %spec.step,
            task_id = %id,
            task_type = ?record.task_type,
            "Task queued"
        );

        let inner = Arc::clone(&self.inner);
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while workers.try_join_next().is_some() {}
        workers.spawn(run_task(inner, record, spec.request));
        Ok(id)
    }

    /// Queue every spec; the batch runs concurrently up to the concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns the first `StoreError`; specs before it stay queued.
    pub async fn queue_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, StoreError> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.queue_task(spec).await?);
        }
        Ok(ids)
    }

    /// # Errors
    ///
    /// Returns a `StoreError` if the task rows cannot be read.
    pub async fn batch_status(
        &self,
        session: &SessionId,
        phase: u32,
        step: StepName,
        round: u32,
    ) -> Result<BatchStatus, StoreError> {
        let tasks = self
            .inner
            .store
            .tasks_for(session, phase, step, round)
            .await?;
        Ok(BatchStatus::from_tasks(tasks))
    }

    /// Wait until every spawned worker has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut set = {
                let mut workers = self
                    .inner
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *workers)
            };
            if set.is_empty() {
                return;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Task worker aborted");
                }
            }
        }
    }

    /// Run `request` inline with the same timeout and retry policy, writing nothing.
    ///
    /// # Errors
    ///
    /// Returns the [`TaskFailure`] a worker would have recorded.
    pub async fn run_direct(&self, request: &TaskRequest) -> Result<Value, TaskFailure> {
        let (outcome, _) = execute_with_retry(&self.inner, request, "direct").await;
        outcome
    }
}

/// Delay before retry number `attempt` (1-based): exponential, capped.
#[must_use]
pub fn backoff_delay(settings: &DispatchSettings, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = settings.initial_backoff.as_secs_f64() * settings.backoff_multiplier.powi(exponent);
    let cap = settings.max_backoff.as_secs_f64();
    if secs.is_finite() {
        Duration::from_secs_f64(secs.clamp(0.0, cap))
    } else {
        settings.max_backoff
    }
}

async fn run_task(inner: Arc<Inner>, mut record: TaskRecord, request: TaskRequest) {
    let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
        return;
    };

    record.status = TaskStatus::Running;
    record.started_at = Some(Utc::now());
    if let Err(e) = inner.store.upsert_task(&record).await {
        warn!(task_id = %record.id, error = %e, "Could not mark task RUNNING");
    }

    let (outcome, attempts) = execute_with_retry(&inner, &request, record.id.as_str()).await;
    record.attempts = attempts;
    record.finished_at = Some(Utc::now());
    match outcome {
        Ok(result) => {
            record.status = TaskStatus::Done;
            record.result = Some(result);
        }
        Err(failure) => {
            warn!(
                task_id = %record.id,
                attempts = failure.attempts,
                error = %failure.message,
                "Task failed"
            );
            record.status = TaskStatus::Failed;
            record.result = failure.raw.as_ref().map(|raw| json!({ "raw": raw }));
            record.error = Some(failure.message);
        }
    }

    if let Err(e) = inner.store.upsert_task(&record).await {
        tracing::error!(task_id = %record.id, error = %e, "Could not record task result");
        return;
    }

    debug!(task_id = %record.id, status = %record.status.as_str(), "Task finished");
    // No subscribers is fine; polling picks the result up.
    let _ = inner.events.send(TaskCompletion {
        session_id: record.session_id.clone(),
        task_id: record.id.clone(),
        phase: record.phase,
        step: record.step,
        status: record.status,
    });
}

async fn execute_with_retry(
    inner: &Inner,
    request: &TaskRequest,
    label: &str,
) -> (Result<Value, TaskFailure>, u32) {
    let max_attempts = inner.settings.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match execute_once(inner, request).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(&inner.settings, attempt);
                let failure = e.into_failure(attempt);
                warn!(
                    task = %label,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure.message,
                    "Transient task failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e.into_failure(attempt)), attempt),
        }
    }
}

async fn execute_once(inner: &Inner, request: &TaskRequest) -> Result<Value, AttemptError> {
    let timeout = inner.settings.call_timeout;
    match request {
        TaskRequest::Completion(req) => {
            let response = tokio::time::timeout(timeout, inner.completion.complete(req.clone()))
                .await
                .map_err(|_| AttemptError::Llm(LlmError::Timeout { duration: timeout }))?
                .map_err(AttemptError::Llm)?;

            let (value, repairs) = if req.structured_output {
                let decoded = decode_object(&response.text).map_err(AttemptError::Decode)?;
                let repairs: Vec<String> =
                    decoded.repairs.iter().map(|r| format!("{r:?}")).collect();
                (decoded.value, repairs)
            } else {
                (Value::String(response.text.clone()), Vec::new())
            };

            Ok(json!({
                "text": response.text,
                "value": value,
                "repairs": repairs,
                "usage": response.usage,
                "provider": response.provider,
                "model": response.model_used,
            }))
        }
        TaskRequest::Search(req) => {
            let response = tokio::time::timeout(timeout, inner.search.search(req.clone()))
                .await
                .map_err(|_| AttemptError::Llm(LlmError::Timeout { duration: timeout }))?
                .map_err(AttemptError::Llm)?;

            Ok(json!({
                "query": req.query,
                "answer": response.answer,
                "citations": response.citations,
                "usage": response.usage,
                "provider": response.provider,
                "model": response.model_used,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_llm::fake::{ScriptedCompletion, ScriptedSearch};
    use cotflow_store::MemoryStore;
    use cotflow_utils::test_support::session_id;

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            max_concurrency: 2,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn dispatcher(
        completion: Arc<ScriptedCompletion>,
        search: Arc<ScriptedSearch>,
        settings: DispatchSettings,
    ) -> Dispatcher {
        Dispatcher::new(Arc::new(MemoryStore::new()), completion, search, settings)
    }

    fn completion_spec(index: u32, prompt: &str) -> TaskSpec {
        let mut req = CompletionRequest::from_prompt(None, prompt);
        req.structured_output = true;
        TaskSpec {
            session_id: session_id("d"),
            phase: 1,
            step: StepName::Think,
            round: 1,
            index,
            request: TaskRequest::Completion(req),
        }
    }

    fn search_spec(index: u32, query: &str) -> TaskSpec {
        TaskSpec {
            session_id: session_id("d"),
            phase: 1,
            step: StepName::Execute,
            round: 1,
            index,
            request: TaskRequest::Search(SearchRequest {
                query: query.to_string(),
                system_instruction: None,
            }),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let settings = DispatchSettings::default();
        assert_eq!(backoff_delay(&settings, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&settings, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&settings, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&settings, 30), settings.max_backoff);
    }

    #[tokio::test]
    async fn test_completion_task_decodes_structured_output() {
        let completion = Arc::new(ScriptedCompletion::new("```json\n{\"a\": 1,}\n```"));
        let d = dispatcher(completion, Arc::new(ScriptedSearch::new("x")), fast_settings());

        let id = d.queue_task(completion_spec(0, "p")).await.unwrap();
        d.wait_idle().await;

        let task = d.store().get_task(&session_id("d"), &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 1);
        let result = task.result.unwrap();
        assert_eq!(result["value"], json!({"a": 1}));
        assert!(!result["repairs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_is_idempotent() {
        let completion = Arc::new(ScriptedCompletion::new("{}"));
        let d = dispatcher(
            Arc::clone(&completion),
            Arc::new(ScriptedSearch::new("x")),
            fast_settings(),
        );
        let first = d.queue_task(completion_spec(0, "p")).await.unwrap();
        let second = d.queue_task(completion_spec(0, "p")).await.unwrap();
        d.wait_idle().await;
        assert_eq!(first, second);
        assert_eq!(completion.calls().len(), 1);
        assert_eq!(d.store().counts().await.unwrap().tasks, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let completion = Arc::new(ScriptedCompletion::new("{}").on_sequence(
            "flaky",
            vec![
                Err(LlmError::ProviderOutage("503".into())),
                Ok("{\"ok\": true}".into()),
            ],
        ));
        let d = dispatcher(
            Arc::clone(&completion),
            Arc::new(ScriptedSearch::new("x")),
            fast_settings(),
        );
        let id = d.queue_task(completion_spec(0, "flaky")).await.unwrap();
        d.wait_idle().await;

        let task = d.store().get_task(&session_id("d"), &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 2);
        assert_eq!(completion.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let completion = Arc::new(
            ScriptedCompletion::new("{}")
                .failing_by_default(LlmError::ProviderAuth("401 bad key".into())),
        );
        let d = dispatcher(
            Arc::clone(&completion),
            Arc::new(ScriptedSearch::new("x")),
            fast_settings(),
        );
        let id = d.queue_task(completion_spec(0, "p")).await.unwrap();
        d.wait_idle().await;

        let task = d.store().get_task(&session_id("d"), &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        assert!(task.error.unwrap().contains("401"));
        assert_eq!(completion.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_output_is_kept_verbatim() {
        let completion = Arc::new(ScriptedCompletion::new("no json here at all"));
        let d = dispatcher(completion, Arc::new(ScriptedSearch::new("x")), fast_settings());
        let id = d.queue_task(completion_spec(0, "p")).await.unwrap();
        d.wait_idle().await;

        let task = d.store().get_task(&session_id("d"), &id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.result.unwrap()["raw"], json!("no json here at all"));
    }

    #[tokio::test]
    async fn test_batch_respects_concurrency_limit() {
        let search = Arc::new(ScriptedSearch::new("answer").with_delay(Duration::from_millis(20)));
        let d = dispatcher(
            Arc::new(ScriptedCompletion::new("{}")),
            Arc::clone(&search),
            fast_settings(),
        );
        let specs = (0..6).map(|i| search_spec(i, &format!("q{i}"))).collect();
        let ids = d.queue_batch(specs).await.unwrap();
        d.wait_idle().await;

        assert_eq!(ids.len(), 6);
        assert!(search.max_in_flight() <= 2);
        let status = d
            .batch_status(&session_id("d"), 1, StepName::Execute, 1)
            .await
            .unwrap();
        assert_eq!(status.done, 6);
        assert!(status.is_settled());
        assert_eq!(status.results[3].result.as_ref().unwrap()["query"], json!("q3"));
    }

    #[tokio::test]
    async fn test_completion_event_is_broadcast() {
        let d = dispatcher(
            Arc::new(ScriptedCompletion::new("{}")),
            Arc::new(ScriptedSearch::new("x")),
            fast_settings(),
        );
        let mut events = d.subscribe();
        let id = d.queue_task(completion_spec(0, "p")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_transient() {
        let completion =
            Arc::new(ScriptedCompletion::new("{}").with_delay(Duration::from_millis(200)));
        let mut settings = fast_settings();
        settings.call_timeout = Duration::from_millis(10);
        settings.max_attempts = 2;
        let d = dispatcher(Arc::clone(&completion), Arc::new(ScriptedSearch::new("x")), settings);

        let err = d
            .run_direct(&completion_spec(0, "p").request)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.message.contains("Timeout"));
        assert_eq!(d.store().counts().await.unwrap().tasks, 0);
    }
}
