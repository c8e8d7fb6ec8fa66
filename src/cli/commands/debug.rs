//! `debug-run-step`: run one step in isolation.

use anyhow::{Context, Result};
use std::path::PathBuf;

use cotflow_config::Config;
use cotflow_engine::{DebugOptions, DebugRunResult, MockData};
use cotflow_utils::exit_codes::ExitCode;
use cotflow_utils::types::StepName;

use super::common::{Output, backend_handle, offline_handle, parse_session_id};

#[derive(Debug)]
pub struct DebugRequest {
    pub id: String,
    pub phase: u32,
    pub step: StepName,
    pub dry_run: bool,
    pub save: bool,
    pub skip_search: bool,
    pub mock: Option<PathBuf>,
}

impl DebugRequest {
    /// Whether this run can reach a backend at all.
    fn needs_backend(&self) -> bool {
        !(self.dry_run || (self.step == StepName::Execute && self.skip_search))
    }
}

pub async fn execute_debug_command(
    request: DebugRequest,
    config: Config,
    output: Output,
) -> Result<ExitCode> {
    let id = parse_session_id(&request.id)?;
    let mock_data = request.mock.as_deref().map(load_mock).transpose()?;
    let handle = if request.needs_backend() {
        backend_handle(config)?
    } else {
        offline_handle(config)?
    };

    let options = DebugOptions {
        mock_data,
        dry_run: request.dry_run,
        save_persisted: request.save,
        skip_search: request.skip_search,
    };
    let result = handle
        .debugger()
        .run_step(&id, request.phase, request.step, options)
        .await?;

    if output.json {
        output.emit_json(&result)?;
    } else {
        print_result(&result);
    }

    Ok(if result.error.is_some() {
        ExitCode::BACKEND_FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn load_mock(path: &std::path::Path) -> Result<MockData> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mock data file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse mock data file: {}", path.display()))
}

fn print_result(result: &DebugRunResult) {
    let mode = if result.dry_run { " (dry run)" } else { "" };
    println!(
        "Session {} phase {} {}{mode}",
        result.session_id, result.phase, result.step
    );
    println!("  Context keys: {}", result.context_keys.join(", "));

    if !result.missing_requirements.is_empty() {
        println!(
            "  Missing requirements: {}",
            result.missing_requirements.join(", ")
        );
    }
    if !result.missing_placeholders.is_empty() {
        println!(
            "  Unresolved placeholders: {}",
            result.missing_placeholders.join(", ")
        );
    }
    if let Some(system) = &result.system {
        println!("\n--- system ---\n{system}");
    }
    if let Some(prompt) = &result.prompt {
        println!("\n--- prompt ---\n{prompt}");
    }
    if !result.planned_queries.is_empty() {
        println!("\n--- planned queries ---");
        for query in &result.planned_queries {
            println!("  • {query}");
        }
    }
    if let Some(value) = &result.result {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        println!("\n--- result ---\n{text}");
    }
    if let Some(err) = &result.error {
        println!("\n✗ Step failed: {err}");
    }
    if result.persisted {
        println!("\n✓ Result saved to phase {}", result.phase);
    }
}
