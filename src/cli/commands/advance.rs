//! Advance and run commands.
//!
//! Both dispatch work onto the in-process task queue, so they wait for the
//! queue to drain before the process exits. Otherwise the tasks would be
//! dropped with the runtime and left PENDING in the store.

use anyhow::Result;
use std::time::Duration;

use cotflow_config::Config;
use cotflow_engine::AdvanceReport;
use cotflow_utils::exit_codes::ExitCode;

use super::common::{Output, backend_handle, describe_outcome, exit_code_for, parse_session_id};

pub async fn execute_advance_command(id: &str, config: Config, output: Output) -> Result<ExitCode> {
    let id = parse_session_id(id)?;
    let handle = backend_handle(config)?;
    let report = handle.orchestrator().advance(&id).await?;

    print_report(&report, output)?;
    if !report.queued_task_ids.is_empty() && !output.json {
        eprintln!(
            "  Waiting for {} queued task(s); run `cotflow advance {id}` afterwards to record them",
            report.queued_task_ids.len()
        );
    }
    handle.shutdown().await;
    Ok(exit_code_for(&report))
}

pub async fn execute_run_command(
    id: &str,
    poll_ms: u64,
    config: Config,
    output: Output,
) -> Result<ExitCode> {
    let id = parse_session_id(id)?;
    let handle = backend_handle(config)?;
    let report = handle
        .driver()
        .with_poll_interval(Duration::from_millis(poll_ms))
        .run_session(&id)
        .await;
    handle.shutdown().await;
    let report = report?;

    print_report(&report, output)?;
    Ok(exit_code_for(&report))
}

fn print_report(report: &AdvanceReport, output: Output) -> Result<()> {
    if output.json {
        return output.emit_json(report);
    }

    let marker = if exit_code_for(report).is_success() {
        "✓"
    } else {
        "✗"
    };
    println!(
        "{marker} Session {}: {}",
        report.session_id,
        describe_outcome(&report.outcome)
    );
    println!(
        "  Position: phase {} {} ({})",
        report.phase, report.step, report.status
    );
    for task_id in &report.queued_task_ids {
        println!("  queued {task_id}");
    }
    Ok(())
}
