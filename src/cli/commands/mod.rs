//! CLI command implementations.
//!
//! Every handler returns the exit code for a completed command; `Err` is
//! reserved for failures that `run.rs` reports.

mod advance;
mod common;
mod debug;
mod session;

use anyhow::Result;
use tracing::debug;

use cotflow_config::Config;
use cotflow_utils::exit_codes::ExitCode;

use super::args::Commands;

pub use common::{Output, parse_params};

/// Dispatch one parsed command.
pub async fn execute(command: Commands, config: Config, output: Output) -> Result<ExitCode> {
    debug!(
        command = command.operation(),
        state_dir = %config.state_dir(),
        "Dispatching command"
    );
    match command {
        Commands::Create { id, config_json, set } => {
            let params = parse_params(config_json.as_deref(), &set)?;
            session::execute_create_command(id.as_deref(), params, config, output).await
        }
        Commands::Advance { id } => advance::execute_advance_command(&id, config, output).await,
        Commands::Run { id, poll_ms } => {
            advance::execute_run_command(&id, poll_ms, config, output).await
        }
        Commands::Status { id } => session::execute_status_command(&id, config, output).await,
        Commands::List => session::execute_list_command(config, output).await,
        Commands::Resume { id } => session::execute_resume_command(&id, config, output).await,
        Commands::Cancel { id } => session::execute_cancel_command(&id, config, output).await,
        Commands::DebugRunStep {
            id,
            phase,
            step,
            dry_run,
            save,
            skip_search,
            mock,
        } => {
            let request = debug::DebugRequest {
                id,
                phase,
                step: step.into(),
                dry_run,
                save,
                skip_search,
                mock,
            };
            debug::execute_debug_command(request, config, output).await
        }
    }
}
