mod common;

use std::time::Duration;

use history::{RunOutcome, StepStore};
use runtime::{
    AutoOperator, EventKind, Lifecycle, Orchestrator, OrchestratorConfig, Request, SessionEvent,
};
use serde_json::json;

use common::{Scripted, calc_provider, fast_settings};

const WAIT: Duration = Duration::from_secs(10);

const ADD: &str = r#"{"llm_response_type":"function_call","function":{"name":"add","parameters":{"a":1,"b":2},"reasoning_tag":"ARITHMETIC"}}"#;
const FINAL: &str = r#"{"llm_response_type":"final_answer","result":"3","summary":"1 + 2 = 3"}"#;

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        supervisor: fast_settings(),
        tool_timeout: WAIT,
        ..OrchestratorConfig::default()
    }
}

fn finals(events: &[SessionEvent]) -> Vec<&SessionEvent> {
    events.iter().filter(|e| e.kind == EventKind::Final).collect()
}

#[tokio::test]
async fn add_one_and_two_end_to_end() {
    let orchestrator = Orchestrator::new(
        vec![calc_provider("calc")],
        Scripted::new(&[ADD, FINAL]),
        AutoOperator,
        config(),
    )
    .unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait_until_ready(WAIT).await.unwrap();
    assert!(orchestrator.registry().resolve("add").is_ok());

    let store_dir = tempfile::tempdir().unwrap();
    let db = store_dir.path().join("runs.db");
    let session = orchestrator
        .submit(Request::new("Add 1 and 2").store(StepStore::open(&db).unwrap()))
        .unwrap();
    let events = orchestrator
        .broker()
        .drain(session)
        .unwrap()
        .collect_events(WAIT)
        .await
        .unwrap();

    let finals = finals(&events);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].content, "3");
    assert!(events.iter().all(|e| e.kind != EventKind::Error));
    assert!(events.iter().any(|e| e.content == "calc/add returned 3"));
    assert_eq!(events.last().unwrap().kind, EventKind::Final);
    assert!(orchestrator.broker().is_empty());

    let store = StepStore::open(&db).unwrap();
    let runs = store.list_runs().unwrap();
    assert_eq!(runs[0].outcome, Some(RunOutcome::Completed));
    let results = store.load_steps(session, Some("tool_result")).unwrap();
    assert_eq!(results.len(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn provider_crash_ends_session_with_error_event() {
    let crash = r#"{"llm_response_type":"function_call","function":{"name":"crash","parameters":{}}}"#;
    let orchestrator = Orchestrator::new(
        vec![calc_provider("calc")],
        Scripted::new(&[crash]),
        AutoOperator,
        config(),
    )
    .unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait_until_ready(WAIT).await.unwrap();

    let session = orchestrator.submit(Request::new("crash it")).unwrap();
    let events = orchestrator
        .broker()
        .drain(session)
        .unwrap()
        .collect_events(WAIT)
        .await
        .unwrap();

    assert!(finals(&events).is_empty());
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert!(last.content.contains("crash failed"));

    // The provider comes back and its tools are registered again.
    orchestrator.wait_until_ready(WAIT).await.unwrap();
    assert!(orchestrator.registry().resolve("add").is_ok());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn duplicate_provider_names_are_rejected() {
    let result = Orchestrator::new(
        vec![calc_provider("calc"), calc_provider("calc")],
        Scripted::new(&[]),
        AutoOperator,
        config(),
    );
    assert!(matches!(result, Err(runtime::Error::Config(_))));
}

#[tokio::test]
async fn second_provider_with_same_tools_is_refused() {
    let orchestrator = Orchestrator::new(
        vec![calc_provider("calc"), calc_provider("calc-mirror")],
        Scripted::new(&[]),
        AutoOperator,
        config(),
    )
    .unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait_until_ready(WAIT).await.unwrap();

    let conflicts = orchestrator.registry().conflicts();
    assert_eq!(conflicts.len(), 1);
    let owner = orchestrator.registry().resolve("add").unwrap().provider;
    assert_ne!(owner, conflicts[0].rejected);
    assert_eq!(owner, conflicts[0].existing);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn bridge_reaches_providers_outside_a_session() {
    let orchestrator = Orchestrator::new(
        vec![calc_provider("calc")],
        Scripted::new(&[]),
        AutoOperator,
        config(),
    )
    .unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait_until_ready(WAIT).await.unwrap();

    let status = orchestrator.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].lifecycle, Lifecycle::Ready);
    assert!(status[0].tools >= 4);

    let result = orchestrator
        .bridge()
        .call_tool("calc", "multiply", Some(json!({"a": 6, "b": 7})), WAIT)
        .await
        .unwrap();
    assert_eq!(result.texts(), ["42"]);

    let err = orchestrator
        .bridge()
        .call_tool("nope", "add", None, WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, runtime::Error::UnknownProvider(_)));
    orchestrator.shutdown().await;
}
