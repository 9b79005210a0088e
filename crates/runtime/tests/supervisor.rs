mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp::CallToolResult;
use runtime::{
    CommandBridge, CommandFuture, Error, Lifecycle, ProviderSupervisor, ToolRegistry,
};
use serde_json::json;

use common::{calc_provider, fast_settings};

const READY: Duration = Duration::from_secs(10);

fn add(supervisor: &ProviderSupervisor, a: i64, b: i64) -> runtime::ResultFuture<CallToolResult> {
    supervisor
        .submit::<CallToolResult, _>(move |conn| {
            Box::pin(async move { conn.call_tool("add", Some(json!({"a": a, "b": b}))).await })
        })
        .unwrap()
}

#[tokio::test]
async fn discovers_catalog_when_ready() {
    let supervisor = ProviderSupervisor::new(calc_provider("calc"), fast_settings());
    assert!(supervisor.list_tools().is_empty());

    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let names: Vec<String> = supervisor.list_tools().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"add".to_string()));
    assert!(names.contains(&"crash".to_string()));
    assert!(supervisor.list_tools().iter().all(|t| t.provider == "calc"));
    assert_eq!(supervisor.status().generation, 1);

    supervisor.stop().await;
    assert_eq!(supervisor.lifecycle(), Lifecycle::Stopped);
    assert!(supervisor.list_tools().is_empty());
}

#[tokio::test]
async fn commands_run_in_submission_order() {
    let supervisor = Arc::new(ProviderSupervisor::new(calc_provider("calc"), fast_settings()));
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let submitter = Arc::clone(&supervisor);
    let log = Arc::clone(&order);
    let futures = std::thread::spawn(move || {
        (0..20i64)
            .map(|i| {
                let log = Arc::clone(&log);
                submitter
                    .submit::<CallToolResult, _>(move |conn| {
                        log.lock().unwrap().push(i);
                        Box::pin(async move {
                            conn.call_tool("add", Some(json!({"a": i, "b": 1}))).await
                        })
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>()
    })
    .join()
    .unwrap();

    for (i, future) in futures.iter().enumerate() {
        let result = future.wait_async(READY).await.unwrap();
        assert_eq!(result.texts(), vec![(i as i64 + 1).to_string()]);
    }
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<i64>>());
    supervisor.stop().await;
}

#[tokio::test]
async fn blocking_wait_from_foreign_thread() {
    let supervisor = Arc::new(ProviderSupervisor::new(calc_provider("calc"), fast_settings()));
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let caller = Arc::clone(&supervisor);
    let result = tokio::task::spawn_blocking(move || add(&caller, 20, 22).wait(READY))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.texts(), vec!["42".to_string()]);
    supervisor.stop().await;
}

#[tokio::test]
async fn tool_error_leaves_provider_ready() {
    let supervisor = ProviderSupervisor::new(calc_provider("calc"), fast_settings());
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let err = supervisor
        .submit::<CallToolResult, _>(|conn| {
            Box::pin(async move { conn.call_tool("divide", Some(json!({"a": 1, "b": 0}))).await })
        })
        .unwrap()
        .wait_async(READY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(msg) if msg.contains("division by zero")));

    assert_eq!(supervisor.lifecycle(), Lifecycle::Ready);
    let sum = add(&supervisor, 1, 2).wait_async(READY).await.unwrap();
    assert_eq!(sum.texts(), vec!["3".to_string()]);
    assert_eq!(supervisor.status().generation, 1);
    supervisor.stop().await;
}

#[tokio::test]
async fn panicking_command_fails_its_future_only() {
    let supervisor = ProviderSupervisor::new(calc_provider("calc"), fast_settings());
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let err = supervisor
        .submit::<(), _>(|_conn| -> CommandFuture<'_, ()> { panic!("boom") })
        .unwrap()
        .wait_async(READY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(ref msg) if msg.contains("boom")), "{err}");

    let err = supervisor
        .submit::<(), _>(|conn| {
            Box::pin(async move {
                let pinged: mcp::Result<()> = conn.ping().await;
                if pinged.is_ok() {
                    panic!("after ping");
                }
                pinged
            })
        })
        .unwrap()
        .wait_async(READY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed(ref msg) if msg.contains("after ping")), "{err}");

    assert_eq!(supervisor.lifecycle(), Lifecycle::Ready);
    let sum = add(&supervisor, 2, 2).wait_async(READY).await.unwrap();
    assert_eq!(sum.texts(), vec!["4".to_string()]);
    assert_eq!(supervisor.status().generation, 1);

    tokio::time::timeout(READY, supervisor.stop()).await.unwrap();
    assert_eq!(supervisor.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn crash_fails_inflight_and_restarts() {
    let supervisor = ProviderSupervisor::new(calc_provider("calc"), fast_settings());
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    let crash = supervisor
        .submit::<CallToolResult, _>(|conn| {
            Box::pin(async move { conn.call_tool("crash", None).await })
        })
        .unwrap();
    let err = crash.wait_async(READY).await.unwrap_err();
    assert!(matches!(err, Error::ProviderUnavailable(name) if name == "calc"));

    let mut status = supervisor.subscribe();
    tokio::time::timeout(READY, status.wait_for(|s| s.generation >= 2))
        .await
        .unwrap()
        .unwrap();
    drop(status);

    supervisor.wait_until_ready(READY).await.unwrap();
    assert!(supervisor.list_tools().iter().any(|t| t.name == "add"));
    let sum = add(&supervisor, 2, 2).wait_async(READY).await.unwrap();
    assert_eq!(sum.texts(), vec!["4".to_string()]);
    supervisor.stop().await;
}

#[tokio::test]
async fn handshake_failures_retry_until_provider_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let gate = dir.path().join("open");
    let config = calc_provider("gated").env("CALC_PROVIDER_GATE", gate.to_string_lossy());
    let supervisor = ProviderSupervisor::new(config, fast_settings());
    supervisor.start().unwrap();

    let err = supervisor
        .wait_until_ready(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(supervisor.list_tools().is_empty());
    assert!(supervisor.status().last_error.is_some());

    std::fs::write(&gate, b"").unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();
    assert!(!supervisor.list_tools().is_empty());
    supervisor.stop().await;
}

#[tokio::test]
async fn registry_follows_supervisor_lifecycle() {
    let supervisor = Arc::new(ProviderSupervisor::new(calc_provider("calc"), fast_settings()));
    let registry = Arc::new(ToolRegistry::new());
    let watcher = registry.attach(&supervisor);
    supervisor.start().unwrap();
    supervisor.wait_until_ready(READY).await.unwrap();

    tokio::time::timeout(READY, async {
        while registry.resolve("add").is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(registry.resolve("add").unwrap().provider, "calc");

    let bridge = CommandBridge::new([Arc::clone(&supervisor)]);
    let result = bridge
        .call_tool("calc", "multiply", Some(json!({"a": 6, "b": 7})), READY)
        .await
        .unwrap();
    assert_eq!(result.texts(), vec!["42".to_string()]);

    supervisor.stop().await;
    watcher.await.unwrap();
    assert!(registry.is_empty());
}
