//! Structured logging setup and step-level log helpers.
//!
//! All engine events carry `session_id`, `phase` and `step` fields so a single
//! run can be filtered out of interleaved output with `RUST_LOG` or `grep`.

use std::io::IsTerminal;
use tracing::{Level, error, info, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::redaction::redact_secrets;

/// Output shape for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Check if colored output should be used.
///
/// Returns true only if stderr is a terminal and `NO_COLOR` is not set.
fn use_color() -> bool {
    std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `cotflow=debug` with `verbose` and
/// `cotflow=info` without. Logs go to stderr so stdout stays clean for
/// `--json` output.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(verbose: bool, format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("cotflow=debug,info")
            } else {
                EnvFilter::try_new("cotflow=info,warn")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_current_span(true)
                        .with_span_list(false),
                )
                .try_init()?;
        }
        LogFormat::Compact => {
            let span_events = if verbose {
                FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            };
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_ansi(use_color())
                        .with_target(verbose)
                        .with_thread_ids(false)
                        .with_line_number(false)
                        .with_file(false)
                        .with_span_events(span_events)
                        .compact(),
                )
                .try_init()?;
        }
    }

    Ok(())
}

/// Span wrapping one `advance` (or debug step) for a session.
pub fn step_span(session_id: &str, phase: u32, step: &str) -> tracing::Span {
    span!(
        Level::INFO,
        "step",
        session_id = %session_id,
        phase = phase,
        step = %step,
    )
}

/// Log that a step's work was dispatched.
pub fn log_step_dispatched(session_id: &str, phase: u32, step: &str, tasks: usize) {
    info!(
        session_id = %session_id,
        phase = phase,
        step = %step,
        tasks = tasks,
        "Step dispatched"
    );
}

/// Log that a step's result was recorded.
pub fn log_step_complete(session_id: &str, phase: u32, step: &str, duration_ms: u128) {
    info!(
        session_id = %session_id,
        phase = phase,
        step = %step,
        duration_ms = %duration_ms,
        "Step completed"
    );
}

/// Log a step failure. The message is redacted before it is emitted.
pub fn log_step_error(session_id: &str, phase: u32, step: &str, message: &str) {
    let sanitized = redact_secrets(message);
    error!(
        session_id = %session_id,
        phase = phase,
        step = %step,
        error = %sanitized,
        "Step failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_span_can_be_entered() {
        let span = step_span("s1", 2, "THINK");
        let _entered = span.enter();
    }

    #[test]
    fn test_log_helpers_do_not_panic_without_subscriber() {
        log_step_dispatched("s1", 1, "EXECUTE", 3);
        log_step_complete("s1", 1, "EXECUTE", 12);
        log_step_error("s1", 1, "EXECUTE", "Bearer abcdef");
    }

    #[test]
    fn test_default_format_is_compact() {
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
