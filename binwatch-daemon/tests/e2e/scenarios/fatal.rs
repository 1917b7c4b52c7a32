//! Fatal ingestion errors: exit, or keep serving queries.

use std::time::Duration;

use binwatch_daemon::{ExitReason, Orchestrator};

use crate::helpers::binlog::orders_session;
use crate::helpers::config::{test_config, with_api};
use crate::helpers::wait_until;

#[tokio::test]
async fn oversized_transaction_exits_with_fatal_reason() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.pipeline.max_transaction_rows = 2;

    let mut orchestrator =
        Orchestrator::build_with_connector(config, orders_session(1..4)).unwrap();
    let reason = tokio::time::timeout(
        Duration::from_secs(15),
        orchestrator.run_until(std::future::pending()),
    )
    .await
    .expect("fatal error did not stop the daemon")
    .unwrap();

    assert!(reason.is_fatal(), "{reason:?}");
    let ExitReason::Fatal(message) = reason else {
        unreachable!()
    };
    assert!(message.contains('2'), "{message}");
    assert!(!dir.path().join("run").join("binwatch.pid").exists());
}

#[tokio::test]
async fn query_api_keeps_serving_when_not_exiting_on_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, port) = with_api(test_config(dir.path()));
    config.pipeline.max_transaction_rows = 2;
    config.general.exit_on_fatal = false;

    let mut orchestrator =
        Orchestrator::build_with_connector(config, orders_session(1..4)).unwrap();
    let monitor = orchestrator.monitor().clone();

    let reason = tokio::time::timeout(
        Duration::from_secs(15),
        orchestrator.run_until(async move {
            wait_until(Duration::from_secs(10), "ingestion halt", || {
                let halted = monitor.snapshot().fatal.is_some();
                async move { halted }
            })
            .await;

            let base = format!("http://127.0.0.1:{port}");
            let health = reqwest::get(format!("{base}/health")).await.unwrap();
            assert_eq!(health.status().as_u16(), 503);
            let body: serde_json::Value = health.json().await.unwrap();
            assert_eq!(body["ingestion"]["stale"], true);

            let changes = reqwest::get(format!("{base}/changes")).await.unwrap();
            assert_eq!(changes.status().as_u16(), 200);
            let body: serde_json::Value = changes.json().await.unwrap();
            assert_eq!(body["data"].as_array().unwrap().len(), 0);
            Ok("TEST")
        }),
    )
    .await
    .expect("daemon did not stop")
    .unwrap();

    assert_eq!(reason, ExitReason::Signal("TEST"));
}
