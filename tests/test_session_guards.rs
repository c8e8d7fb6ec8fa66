//! Guards around session state: dry runs, readiness and concurrent advances.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use cotflow::{
    AdvanceOutcome, Config, DebugOptions, OrchestratorHandle, SessionId, SessionStatus, StepName,
};
use cotflow_llm::fake::{ScriptedCompletion, ScriptedSearch};
use cotflow_store::Claim;
use cotflow_utils::test_support::{TempStateDir, object};
use cotflow_utils::types::TaskStatus;

fn handle(dir: &TempStateDir) -> (OrchestratorHandle, Arc<ScriptedCompletion>) {
    handle_with_delay(dir, Duration::ZERO)
}

fn handle_with_delay(
    dir: &TempStateDir,
    delay: Duration,
) -> (OrchestratorHandle, Arc<ScriptedCompletion>) {
    let config = Config::builder()
        .base_dir(dir.path.clone())
        .state_dir(dir.path.join("state").to_string())
        .backoff_ms(1, 2)
        .build()
        .unwrap();
    let completion = Arc::new(
        ScriptedCompletion::new("{}")
            .on("planning research", r#"{"queries": ["q1", "q2", "q3"]}"#)
            .on("Synthesize", r#"{"trendedTopics": ["A"]}"#)
            .with_delay(delay),
    );
    let handle = OrchestratorHandle::with_backends(
        config,
        completion.clone(),
        Arc::new(ScriptedSearch::new("found")),
    )
    .unwrap();
    (handle, completion)
}

async fn create(handle: &OrchestratorHandle) -> SessionId {
    handle
        .orchestrator()
        .create_session(object(json!({"topic": "X"})), None)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_dry_run_writes_no_rows() {
    let dir = TempStateDir::new();
    let (handle, completion) = handle(&dir);
    let id = create(&handle).await;
    let store = handle.orchestrator().store();
    let before = store.counts().await.unwrap();

    for (phase, step) in [
        (1, StepName::Think),
        (1, StepName::Execute),
        (1, StepName::Integrate),
        (2, StepName::Think),
    ] {
        let options = DebugOptions {
            dry_run: true,
            save_persisted: true,
            ..DebugOptions::default()
        };
        let result = handle
            .debugger()
            .run_step(&id, phase, step, options)
            .await
            .unwrap();
        assert!(result.dry_run);
        assert!(!result.persisted);
        assert!(result.result.is_none());
    }

    assert_eq!(store.counts().await.unwrap(), before);
    assert!(completion.calls().is_empty());
    let session = store.get_session(&id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Created);
}

#[tokio::test]
async fn test_partial_batch_is_not_ready() {
    let dir = TempStateDir::new();
    let (handle, _) = handle(&dir);
    let orch = handle.orchestrator();
    let id = create(&handle).await;

    orch.advance(&id).await.unwrap();
    handle.shutdown().await;
    let report = orch.advance(&id).await.unwrap();
    assert_eq!(report.step, StepName::Execute);
    assert_eq!(report.queued_task_ids.len(), 3);
    handle.shutdown().await;

    // Put one finished search back to PENDING: 2 DONE + 1 PENDING
    let store = orch.store();
    let mut batch = store.tasks_for(&id, 1, StepName::Execute, 1).await.unwrap();
    assert_eq!(batch.len(), 3);
    let mut last = batch.pop().unwrap();
    last.status = TaskStatus::Pending;
    last.result = None;
    last.finished_at = None;
    store.upsert_task(&last).await.unwrap();

    let report = orch.advance(&id).await.unwrap();
    assert_eq!(
        report.outcome,
        AdvanceOutcome::NotReady {
            pending: 1,
            done: 2,
            failed: 0
        }
    );
    assert_eq!(report.status, SessionStatus::Executing);
    let row = store.get_phase(&id, 1).await.unwrap().unwrap();
    assert!(row.execute_result.is_none());
}

#[tokio::test]
async fn test_held_lease_reports_already_executing() {
    let dir = TempStateDir::new();
    let (handle, completion) = handle(&dir);
    let orch = handle.orchestrator();
    let id = create(&handle).await;

    let claimed = orch
        .store()
        .try_claim(&id, "other-process", Duration::from_secs(300))
        .await
        .unwrap();
    let Claim::Acquired { session, .. } = claimed else {
        panic!("expected to acquire the lease");
    };

    let report = orch.advance(&id).await.unwrap();
    assert_eq!(
        report.outcome,
        AdvanceOutcome::AlreadyExecuting {
            holder: "other-process".to_string()
        }
    );
    assert!(completion.calls().is_empty());

    assert!(orch.store().commit_session(&session, "other-process").await.unwrap());
    let report = orch.advance(&id).await.unwrap();
    assert_eq!(report.outcome, AdvanceOutcome::Dispatched);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_advances_dispatch_once() {
    let dir = TempStateDir::new();
    // THINK stays in flight while the racing advances run
    let (handle, completion) = handle_with_delay(&dir, Duration::from_millis(300));
    let id = create(&handle).await;

    let spawned: Vec<_> = (0..8)
        .map(|_| {
            let orch = handle.orchestrator().clone();
            let id = id.clone();
            tokio::spawn(async move { orch.advance(&id).await.unwrap() })
        })
        .collect();
    let mut reports = Vec::with_capacity(spawned.len());
    for task in spawned {
        reports.push(task.await.unwrap());
    }
    handle.shutdown().await;

    let dispatched = reports
        .iter()
        .filter(|r| r.outcome == AdvanceOutcome::Dispatched)
        .count();
    assert_eq!(dispatched, 1);
    for report in &reports {
        assert!(matches!(
            report.outcome,
            AdvanceOutcome::Dispatched
                | AdvanceOutcome::AlreadyExecuting { .. }
                | AdvanceOutcome::NotReady { .. }
        ));
    }

    let tasks = handle.orchestrator().store().session_tasks(&id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(completion.calls().len(), 1);
}

#[tokio::test]
async fn test_resume_of_live_session_is_rejected() {
    let dir = TempStateDir::new();
    let (handle, _) = handle(&dir);
    let id = create(&handle).await;
    handle
        .orchestrator()
        .store()
        .try_claim(&id, "other-process", Duration::from_secs(300))
        .await
        .unwrap();

    let err = handle.orchestrator().resume(&id).await.unwrap_err();
    assert_eq!(err.to_exit_code(), cotflow::ExitCode::CLI_ARGS);
}
