//! End-to-end pipeline runs through the public facade.
//!
//! Sessions are driven with scripted backends over a `JsonFileStore` in a
//! temporary state directory, the same wiring the CLI uses.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use cotflow::{
    AdvanceOutcome, Config, OrchestratorHandle, SessionId, SessionStatus, StepName,
    build_step_context,
};
use cotflow_llm::LlmError;
use cotflow_llm::fake::{ScriptedCompletion, ScriptedSearch};
use cotflow_utils::test_support::{TempStateDir, object};

fn config(dir: &TempStateDir) -> Config {
    Config::builder()
        .base_dir(dir.path.clone())
        .state_dir(dir.path.join("state").to_string())
        .max_attempts(2)
        .backoff_ms(1, 2)
        .call_timeout_secs(5)
        .build()
        .unwrap()
}

fn research_completion() -> ScriptedCompletion {
    ScriptedCompletion::new("{}")
        .on("planning research", r#"{"queries": ["q1", {"query": "q2"}]}"#)
        .on("Synthesize", "```json\n{\"trendedTopics\": [\"A\"],}\n```")
        .on("Evaluate each", r#"{"evaluation": [{"title": "A", "score": 9}]}"#)
        .on("distinct concepts", r#"{"concepts": ["C"]}"#)
        .on("Outline how", r#"{"outlines": ["O"]}"#)
        .on("Write one draft", r#"{"drafts": ["D"]}"#)
}

fn handle(
    dir: &TempStateDir,
    completion: &Arc<ScriptedCompletion>,
    search: &Arc<ScriptedSearch>,
) -> OrchestratorHandle {
    OrchestratorHandle::with_backends(config(dir), completion.clone(), search.clone()).unwrap()
}

async fn create(handle: &OrchestratorHandle, params: Value) -> SessionId {
    handle
        .orchestrator()
        .create_session(object(params), None)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_topic_flows_into_phase_two_think() {
    let dir = TempStateDir::new();
    let completion = Arc::new(research_completion());
    let search = Arc::new(ScriptedSearch::new("found"));
    let handle = handle(&dir, &completion, &search);
    let id = create(&handle, json!({"topic": "X"})).await;

    let report = handle
        .driver()
        .with_poll_interval(Duration::from_millis(20))
        .run_session(&id)
        .await
        .unwrap();
    assert_eq!(report.outcome, AdvanceOutcome::Completed);
    assert_eq!(report.status, SessionStatus::Completed);

    let store = handle.orchestrator().store();
    let session = store.get_session(&id).await.unwrap().unwrap();
    let phases = store.phases(&id).await.unwrap();
    let ctx = build_step_context(
        &session,
        &phases,
        handle.orchestrator().registry(),
        2,
        StepName::Think,
        None,
    );
    assert_eq!(ctx["opportunities"], json!(["A"]));
    assert_eq!(ctx["topic"], json!("X"));

    let phase_two_think = completion
        .calls()
        .into_iter()
        .find(|p| p.contains("Evaluate each"))
        .unwrap();
    assert!(phase_two_think.contains(r#"Opportunities found in research: ["A"]"#));
    assert!(phase_two_think.contains("Topic: X"));

    let row = store.get_phase(&id, 1).await.unwrap().unwrap();
    assert_eq!(row.integrate_result, Some(json!({"trendedTopics": ["A"]})));
    assert_eq!(row.execute_result.unwrap()["searchResults"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_integrate_results_are_chained() {
    let dir = TempStateDir::new();
    let completion = Arc::new(research_completion());
    let search = Arc::new(ScriptedSearch::new("found"));
    let handle = handle(&dir, &completion, &search);
    let id = create(&handle, json!({"topic": "X"})).await;
    handle.driver().run_session(&id).await.unwrap();

    let phases = handle.orchestrator().store().phases(&id).await.unwrap();
    assert_eq!(phases.len(), 3);
    for pair in phases.windows(2) {
        if pair[1].integrate_result.is_some() {
            assert!(pair[0].integrate_result.is_some());
        }
    }
}

#[tokio::test]
async fn test_state_survives_a_new_handle() {
    let dir = TempStateDir::new();
    let completion = Arc::new(research_completion());
    let search = Arc::new(ScriptedSearch::new("found"));

    let id = {
        let first = handle(&dir, &completion, &search);
        let id = create(&first, json!({"topic": "X"})).await;
        let report = first.orchestrator().advance(&id).await.unwrap();
        assert_eq!(report.outcome, AdvanceOutcome::Dispatched);
        first.shutdown().await;
        id
    };

    let second = handle(&dir, &completion, &search);
    let report = second.orchestrator().advance(&id).await.unwrap();
    assert_eq!(report.phase, 1);
    assert_eq!(report.step, StepName::Execute);
    assert_eq!(report.outcome, AdvanceOutcome::Dispatched);
    assert_eq!(report.queued_task_ids.len(), 2);
    second.shutdown().await;

    let row = second.orchestrator().store().get_phase(&id, 1).await.unwrap().unwrap();
    assert_eq!(row.think_result, Some(json!({"queries": ["q1", {"query": "q2"}]})));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = TempStateDir::new();
    let completion = Arc::new(
        ScriptedCompletion::new("{}")
            .on_sequence(
                "planning research",
                vec![
                    Err(LlmError::ProviderOutage("503".into())),
                    Ok(r#"{"queries": []}"#.into()),
                ],
            )
            .on("Synthesize", r#"{"trendedTopics": []}"#),
    );
    let search = Arc::new(ScriptedSearch::new("found"));
    let handle = handle(&dir, &completion, &search);
    let id = create(&handle, json!({"topic": "X"})).await;

    handle.orchestrator().advance(&id).await.unwrap();
    handle.shutdown().await;

    let tasks = handle.orchestrator().store().session_tasks(&id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempts, 2);
    assert_eq!(tasks[0].result.as_ref().unwrap()["value"], json!({"queries": []}));
}

#[tokio::test]
async fn test_non_transient_failure_fails_then_resumes() {
    let dir = TempStateDir::new();
    let completion = Arc::new(
        ScriptedCompletion::new("{}").on_sequence(
            "planning research",
            vec![
                Err(LlmError::ProviderAuth("401".into())),
                Ok(r#"{"queries": []}"#.into()),
            ],
        ),
    );
    let search = Arc::new(ScriptedSearch::new("found"));
    let handle = handle(&dir, &completion, &search);
    let id = create(&handle, json!({"topic": "X"})).await;

    let report = handle.driver().run_session(&id).await.unwrap();
    assert!(matches!(report.outcome, AdvanceOutcome::Failed { .. }));
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(completion.calls().len(), 1);

    let resumed = handle.orchestrator().resume(&id).await.unwrap();
    assert_eq!(resumed.round, 2);
    assert_eq!(resumed.current_step, StepName::Think);

    let report = handle.orchestrator().advance(&id).await.unwrap();
    assert_eq!(report.outcome, AdvanceOutcome::Dispatched);
    assert!(report.queued_task_ids[0].as_str().ends_with("-r2-0"));
}

#[tokio::test]
async fn test_cancel_stops_further_advances() {
    let dir = TempStateDir::new();
    let completion = Arc::new(research_completion());
    let search = Arc::new(ScriptedSearch::new("found"));
    let handle = handle(&dir, &completion, &search);
    let id = create(&handle, json!({"topic": "X"})).await;

    let cancelled = handle.orchestrator().cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);

    let report = handle.orchestrator().advance(&id).await.unwrap();
    assert_eq!(report.outcome, AdvanceOutcome::Terminal);
    assert!(completion.calls().is_empty());
}
