use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use cotflow_utils::types::{
    PhaseStatus, SessionId, SessionStatus, StepName, TaskId, TaskStatus, TaskType,
};

/// Claim on a session held by one `advance` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    #[must_use]
    pub fn new(holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }

    /// A lease older than `ttl` belongs to a holder that is presumed dead.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }
}

/// One pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Domain parameters, opaque to the engine
    pub config: Map<String, Value>,
    pub current_phase: u32,
    pub current_step: StepName,
    pub status: SessionStatus,
    /// Bumped on resume so a retried step gets fresh task ids
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_task: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// New session positioned at phase 1, THINK.
    #[must_use]
    pub fn new(id: SessionId, config: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            current_phase: 1,
            current_step: StepName::Think,
            status: SessionStatus::Created,
            round: 1,
            last_error: None,
            lease: None,
            last_completed_task: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Results of one phase of one session; at most one row per (session, phase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub session_id: SessionId,
    pub phase: u32,
    pub status: PhaseStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrate_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrate_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrate_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrate_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhaseRecord {
    #[must_use]
    pub fn new(session_id: SessionId, phase: u32) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            phase,
            status: PhaseStatus::Thinking,
            think_prompt: None,
            think_result: None,
            think_tokens: None,
            think_at: None,
            execute_result: None,
            execute_duration_ms: None,
            execute_at: None,
            integrate_prompt: None,
            integrate_result: None,
            integrate_tokens: None,
            integrate_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Persisted result of a step, if any.
    #[must_use]
    pub fn result_for(&self, step: StepName) -> Option<&Value> {
        match step {
            StepName::Think => self.think_result.as_ref(),
            StepName::Execute => self.execute_result.as_ref(),
            StepName::Integrate => self.integrate_result.as_ref(),
        }
    }
}

/// One unit of external work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub session_id: SessionId,
    pub phase: u32,
    pub step: StepName,
    pub task_type: TaskType,
    pub round: u32,
    pub index: u32,
    /// Serialized backend request
    pub request: Value,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Whether this task belongs to the batch `(session, phase, step, round)`.
    #[must_use]
    pub fn in_batch(&self, session: &SessionId, phase: u32, step: StepName, round: u32) -> bool {
        &self.session_id == session
            && self.phase == phase
            && self.step == step
            && self.round == round
    }
}

/// Result of [`crate::Store::try_claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Lease taken; `session` is the record as stored after the claim
    Acquired {
        session: SessionRecord,
        previous_status: SessionStatus,
    },
    /// Another holder has a live lease
    Busy { holder: String },
    /// Completed and cancelled sessions are never claimed
    Closed(SessionStatus),
    NotFound,
}

/// Row totals, used to prove that dry runs write nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RowCounts {
    pub sessions: usize,
    pub phases: usize,
    pub tasks: usize,
}
