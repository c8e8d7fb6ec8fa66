//! CLI entry point and dispatch logic
//!
//! This module owns the `run()` function which:
//! - Parses CLI arguments
//! - Initialises logging and discovers Config
//! - Creates the tokio runtime
//! - Dispatches to command handlers
//! - Handles all error output

use clap::Parser;

use cotflow_config::Config;
use cotflow_utils::error::{ConfigError, CotflowError, UserFriendlyError};
use cotflow_utils::exit_codes::ExitCode;
use cotflow_utils::logging::{LogFormat, init_tracing};
use cotflow_utils::redaction::redact_secrets;

use super::args::{Cli, LogFormatArg};
use super::commands;

/// Main CLI execution function.
///
/// Handles ALL output including errors and returns the exit code to use on
/// failure. main.rs only calls `std::process::exit` with it.
pub fn run() -> Result<(), ExitCode> {
    run_with(Cli::parse())
}

/// Execute already-parsed arguments.
pub fn run_with(cli: Cli) -> Result<(), ExitCode> {
    let format = match cli.log_format {
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    // A second initialisation (in-process tests) keeps the first subscriber
    let _ = init_tracing(cli.verbose, format);

    let config = match Config::discover(&cli.config_args()) {
        Ok(config) => config,
        Err(err) => return Err(report_error(&err, "config")),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("✗ Failed to create async runtime: {e}");
            return Err(ExitCode::INTERNAL);
        }
    };

    let operation = cli.command.operation();
    let output = commands::Output { json: cli.json };
    match rt.block_on(commands::execute(cli.command, config, output)) {
        Ok(code) if code.is_success() => Ok(()),
        Ok(code) => Err(code),
        Err(err) => Err(report_error(&err, operation)),
    }
}

/// Print an error report on stderr and pick the exit code for it.
fn report_error(error: &anyhow::Error, operation: &str) -> ExitCode {
    if let Some(err) = error.downcast_ref::<CotflowError>() {
        eprint!("{}", err.display_for_user());
        eprintln!("\n  (while running `cotflow {operation}`)");
        return err.to_exit_code();
    }

    if let Some(err) = error.downcast_ref::<ConfigError>() {
        eprint!("{}", format_report(err));
        return ExitCode::CLI_ARGS;
    }

    eprintln!("✗ Unexpected error: {}", redact_secrets(&format!("{error:#}")));
    if let Some(suggestions) = enhance_error_context(error) {
        eprintln!("\n  Suggestions:");
        for (i, suggestion) in suggestions.iter().enumerate() {
            eprintln!("    {}. {}", i + 1, suggestion);
        }
    }
    eprintln!("\n  Run with --verbose for more detailed output");
    ExitCode::INTERNAL
}

fn format_report(err: &dyn UserFriendlyError) -> String {
    let mut output = format!("Error: {}\n", err.user_message());
    if let Some(ctx) = err.context() {
        output.push_str(&format!("\nContext: {ctx}\n"));
    }
    let suggestions = err.suggestions();
    if !suggestions.is_empty() {
        output.push_str("\nSuggestions:\n");
        for suggestion in suggestions {
            output.push_str(&format!("  • {suggestion}\n"));
        }
    }
    redact_secrets(&output)
}

/// Suggestions for common failures that carry no typed error.
fn enhance_error_context(error: &anyhow::Error) -> Option<Vec<String>> {
    let error_str = format!("{error:#}");

    if error_str.contains("mock data") {
        Some(vec![
            "Check that the --mock file exists and is valid JSON".to_string(),
            "Allowed keys: context, thinkResult, executeResult, searchResults".to_string(),
        ])
    } else if error_str.contains("Permission denied") {
        Some(vec![
            "Check permissions on the state directory".to_string(),
            "Point --state-dir or COTFLOW_HOME at a writable location".to_string(),
        ])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotflow_utils::error::SessionError;

    #[test]
    fn test_report_error_maps_typed_errors() {
        let err = anyhow::Error::from(CotflowError::Session(SessionError::NotFound {
            id: "abc".into(),
        }));
        assert_eq!(report_error(&err, "status"), ExitCode::NOT_FOUND);

        let err = anyhow::Error::from(ConfigError::InvalidValue {
            key: "max_attempts".into(),
            value: "0".into(),
        })
        .context("Failed to load config file");
        assert_eq!(report_error(&err, "config"), ExitCode::CLI_ARGS);

        let err = anyhow::anyhow!("something else");
        assert_eq!(report_error(&err, "run"), ExitCode::INTERNAL);
    }

    #[test]
    fn test_enhance_error_context_for_mock_files() {
        let err = anyhow::anyhow!("Failed to parse mock data file: x.json");
        assert!(enhance_error_context(&err).is_some());
        assert!(enhance_error_context(&anyhow::anyhow!("other")).is_none());
    }
}
