//! Common helper functions used across CLI commands

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use cotflow_config::Config;
use cotflow_engine::{AdvanceOutcome, AdvanceReport, OrchestratorHandle};
use cotflow_utils::error::{ConfigError, CotflowError, SessionError};
use cotflow_utils::exit_codes::ExitCode;
use cotflow_utils::types::{SessionId, SessionStatus};

/// Output mode selected by the global `--json` flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Print `value` as pretty JSON on stdout.
    pub fn emit_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{text}");
        Ok(())
    }
}

/// Validate a session id given on the command line.
pub fn parse_session_id(raw: &str) -> Result<SessionId, CotflowError> {
    SessionId::parse(raw).ok_or_else(|| SessionError::InvalidId { id: raw.to_string() }.into())
}

/// Build session parameters from `--config-json` and `--set key=value` pairs.
///
/// `--set` entries are applied after the JSON object and win on conflicts.
/// A value that parses as JSON keeps its type (`depth=2` is a number,
/// `tags=["a"]` an array); anything else is a string.
pub fn parse_params(
    config_json: Option<&str>,
    set: &[String],
) -> Result<Map<String, Value>, CotflowError> {
    let invalid = |value: String| {
        CotflowError::Config(ConfigError::InvalidValue {
            key: "session parameters".to_string(),
            value,
        })
    };

    let mut params = match config_json {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Err(invalid(format!("expected a JSON object, got {other}"))),
            Err(e) => return Err(invalid(format!("not valid JSON ({e})"))),
        },
        None => Map::new(),
    };

    for pair in set {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(invalid(format!("expected key=value, got `{pair}`")));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid(format!("empty key in `{pair}`")));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }

    Ok(params)
}

/// Handle for commands that never reach a backend.
pub fn offline_handle(config: Config) -> Result<OrchestratorHandle> {
    OrchestratorHandle::offline(config).context("Failed to open the session store")
}

/// Handle with HTTP backends, for commands that may dispatch work.
pub fn backend_handle(config: Config) -> Result<OrchestratorHandle> {
    OrchestratorHandle::from_config(config).context("Failed to configure LLM backends")
}

/// Exit code that reflects where an advance left the session.
#[must_use]
pub fn exit_code_for(report: &AdvanceReport) -> ExitCode {
    match &report.outcome {
        AdvanceOutcome::Failed { .. } => ExitCode::SESSION_FAILED,
        AdvanceOutcome::Blocked { .. } => ExitCode::BLOCKED,
        AdvanceOutcome::AlreadyExecuting { .. } => ExitCode::ALREADY_EXECUTING,
        AdvanceOutcome::Terminal if report.status == SessionStatus::Failed => {
            ExitCode::SESSION_FAILED
        }
        _ => ExitCode::SUCCESS,
    }
}

/// One-line description of an advance outcome for human output.
#[must_use]
pub fn describe_outcome(outcome: &AdvanceOutcome) -> String {
    match outcome {
        AdvanceOutcome::Dispatched => "dispatched".to_string(),
        AdvanceOutcome::NotReady {
            pending,
            done,
            failed,
        } => format!("not ready ({pending} pending, {done} done, {failed} failed)"),
        AdvanceOutcome::Completed => "completed".to_string(),
        AdvanceOutcome::Failed { reason } => format!("failed: {reason}"),
        AdvanceOutcome::Blocked { missing } => format!("blocked, missing: {}", missing.join(", ")),
        AdvanceOutcome::AlreadyExecuting { holder } => {
            format!("already executing (held by {holder})")
        }
        AdvanceOutcome::Terminal => "terminal".to_string(),
    }
}

/// Compact rendering of a stored value for status output.
#[must_use]
pub fn preview(value: &Value, max_chars: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}
