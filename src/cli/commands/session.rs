//! Session lifecycle commands: create, status, list, resume, cancel.

use anyhow::Result;
use serde_json::{Map, Value};

use cotflow_config::Config;
use cotflow_engine::StatusSnapshot;
use cotflow_store::{PhaseRecord, SessionRecord};
use cotflow_strategy::StrategyRegistry;
use cotflow_utils::exit_codes::ExitCode;

use super::common::{Output, offline_handle, parse_session_id, preview};

const PREVIEW_CHARS: usize = 72;

pub async fn execute_create_command(
    id: Option<&str>,
    params: Map<String, Value>,
    config: Config,
    output: Output,
) -> Result<ExitCode> {
    let id = id.map(parse_session_id).transpose()?;
    let handle = offline_handle(config)?;
    let session = handle.orchestrator().create_session(params, id).await?;

    if output.json {
        output.emit_json(&session)?;
    } else {
        let registry = handle.orchestrator().registry();
        println!("✓ Created session {}", session.id);
        println!(
            "  Pipeline: {} phase(s), starting at {}",
            registry.phase_count(),
            phase_label(registry, session.current_phase)
        );
        println!("  Next: cotflow advance {}", session.id);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn execute_status_command(id: &str, config: Config, output: Output) -> Result<ExitCode> {
    let id = parse_session_id(id)?;
    let handle = offline_handle(config)?;
    let snapshot = handle.orchestrator().status(&id).await?;

    if output.json {
        output.emit_json(&snapshot)?;
    } else {
        print_status(&snapshot, handle.orchestrator().registry());
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn execute_list_command(config: Config, output: Output) -> Result<ExitCode> {
    let handle = offline_handle(config)?;
    let sessions = handle.orchestrator().list().await?;

    if output.json {
        output.emit_json(&sessions)?;
    } else if sessions.is_empty() {
        println!("No sessions found in {}", handle.config().state_dir());
    } else {
        println!(
            "{:<36} {:<10} {:>5} {:<9} UPDATED",
            "SESSION", "STATUS", "PHASE", "STEP"
        );
        for session in &sessions {
            println!(
                "{:<36} {:<10} {:>5} {:<9} {}",
                session.id.to_string(),
                session.status.as_str(),
                session.current_phase,
                session.current_step.as_str(),
                session.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn execute_resume_command(id: &str, config: Config, output: Output) -> Result<ExitCode> {
    let id = parse_session_id(id)?;
    let handle = offline_handle(config)?;
    let session = handle.orchestrator().resume(&id).await?;

    if output.json {
        output.emit_json(&session)?;
    } else {
        println!("✓ Resumed session {}", session.id);
        print_position(&session, handle.orchestrator().registry());
        println!("  Next: cotflow advance {}", session.id);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn execute_cancel_command(id: &str, config: Config, output: Output) -> Result<ExitCode> {
    let id = parse_session_id(id)?;
    let handle = offline_handle(config)?;
    let session = handle.orchestrator().cancel(&id).await?;

    if output.json {
        output.emit_json(&session)?;
    } else {
        println!("✓ Cancelled session {}", session.id);
    }
    Ok(ExitCode::SUCCESS)
}

fn phase_label(registry: &StrategyRegistry, phase: u32) -> String {
    registry
        .get(phase)
        .map_or_else(|| format!("phase {phase}"), |s| s.label())
}

fn print_position(session: &SessionRecord, registry: &StrategyRegistry) {
    println!("  Status: {}", session.status);
    println!(
        "  Position: {} {} (round {})",
        phase_label(registry, session.current_phase),
        session.current_step,
        session.round
    );
}

fn print_status(snapshot: &StatusSnapshot, registry: &StrategyRegistry) {
    let session = &snapshot.session;
    println!("Status for session: {}", session.id);
    print_position(session, registry);
    if let Some(err) = &session.last_error {
        println!("  Last error: {err}");
    }
    if !session.config.is_empty() {
        println!(
            "  Parameters: {}",
            preview(&Value::Object(session.config.clone()), PREVIEW_CHARS)
        );
    }

    println!("\nPhases ({} in pipeline):", snapshot.phase_count);
    for phase in 1..=snapshot.phase_count {
        match snapshot.phases.iter().find(|p| p.phase == phase) {
            Some(row) => print_phase_row(row, registry),
            None => println!("  {}: not started", phase_label(registry, phase)),
        }
    }

    if !snapshot.tasks.is_empty() {
        println!("\nTasks:");
        for batch in &snapshot.tasks {
            println!(
                "  phase {} {} round {}: {} pending, {} running, {} done, {} failed",
                batch.phase,
                batch.step,
                batch.round,
                batch.pending,
                batch.running,
                batch.done,
                batch.failed
            );
        }
    }
}

fn print_phase_row(row: &PhaseRecord, registry: &StrategyRegistry) {
    println!("  {}: {}", phase_label(registry, row.phase), row.status.as_str());
    let steps = [
        ("think", row.think_result.as_ref()),
        ("execute", row.execute_result.as_ref()),
        ("integrate", row.integrate_result.as_ref()),
    ];
    for (name, result) in steps {
        if let Some(value) = result {
            println!("    {name:<9} {}", preview(value, PREVIEW_CHARS));
        }
    }
}
