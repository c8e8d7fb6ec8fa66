use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{EnumString, VariantNames};

/// Identifier of one pipeline run.
///
/// Session ids are used as file names by the file-backed store, so they are
/// restricted to ASCII alphanumerics, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier, rejecting characters that are unsafe in paths.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cotflow_utils::types::SessionId;
    ///
    /// assert!(SessionId::parse("run-42").is_some());
    /// assert!(SessionId::parse("../etc").is_none());
    /// assert!(SessionId::parse("").is_none());
    /// ```
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    /// Generate a fresh, time-ordered identifier.
    #[must_use]
    pub fn generate() -> Self {
        let now = Utc::now();
        let nanos = now.timestamp_subsec_nanos();
        Self(format!("s{}{:08x}", now.format("%Y%m%d%H%M%S"), nanos))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one unit of external work.
///
/// Task ids are derived from the task's natural identity so queuing the same
/// request twice addresses the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build the id for task `index` of the batch `(session, phase, step, round)`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cotflow_utils::types::{SessionId, StepName, TaskId};
    ///
    /// let session = SessionId::parse("abc").unwrap();
    /// let id = TaskId::derive(&session, 2, StepName::Execute, 1, 3);
    /// assert_eq!(id.as_str(), "abc-p2-execute-r1-3");
    /// ```
    #[must_use]
    pub fn derive(session: &SessionId, phase: u32, step: StepName, round: u32, index: u32) -> Self {
        Self(format!(
            "{}-p{}-{}-r{}-{}",
            session,
            phase,
            step.as_str().to_ascii_lowercase(),
            round,
            index
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the three steps every phase walks through.
///
/// ```text
/// THINK → EXECUTE → INTEGRATE
/// ```
///
/// # Example
///
/// ```rust
/// use cotflow_utils::types::StepName;
///
/// assert_eq!(StepName::Think.next(), Some(StepName::Execute));
/// assert_eq!(StepName::Integrate.next(), None);
/// assert_eq!("execute".parse::<StepName>().unwrap(), StepName::Execute);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, VariantNames,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum StepName {
    /// Completion call producing the phase's plan.
    Think,
    /// Fan-out work implied by THINK, or a pass-through.
    Execute,
    /// Completion call synthesising THINK and EXECUTE into the phase result.
    Integrate,
}

impl StepName {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Think => "THINK",
            Self::Execute => "EXECUTE",
            Self::Integrate => "INTEGRATE",
        }
    }

    /// The step that follows this one within the same phase.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Think => Some(Self::Execute),
            Self::Execute => Some(Self::Integrate),
            Self::Integrate => None,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a session.
///
/// `Completed`, `Failed` and `Cancelled` are terminal for `advance`; a failed
/// session can only leave that state through an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum SessionStatus {
    Created,
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one phase row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Thinking,
    Executing,
    Integrating,
    Completed,
    Failed,
}

impl PhaseStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "THINKING",
            Self::Executing => "EXECUTING",
            Self::Integrating => "INTEGRATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Status a phase takes while the given step is in progress.
    #[must_use]
    pub const fn for_step(step: StepName) -> Self {
        match step {
            StepName::Think => Self::Thinking,
            StepName::Execute => Self::Executing,
            StepName::Integrate => Self::Integrating,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which external service a task talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Completion,
    Search,
}

impl TaskType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "COMPLETION",
            Self::Search => "SEARCH",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
