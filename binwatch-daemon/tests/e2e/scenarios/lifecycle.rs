//! Startup, steady-state flow and graceful shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use binwatch_core::types::DeliveryStatus;
use binwatch_daemon::pid::{PidFile, read_pid};
use binwatch_daemon::{ExitReason, Orchestrator};
use binwatch_store::{AlertQuery, ChangeQuery, ChangeStore};

use crate::helpers::binlog::{orders_rule, orders_session};
use crate::helpers::config::{test_config, with_api};
use crate::helpers::wait_until;

const RUN_TIMEOUT: Duration = Duration::from_secs(15);

fn stored_changes(store: &ChangeStore) -> usize {
    store
        .query_changes(&ChangeQuery {
            table: Some("shop.orders".to_owned()),
            ..ChangeQuery::default()
        })
        .map(|c| c.len())
        .unwrap_or(0)
}

fn pending_alerts(store: &ChangeStore) -> usize {
    store
        .query_alerts(&AlertQuery {
            status: Some(DeliveryStatus::Pending),
            ..AlertQuery::default()
        })
        .map(|a| a.len())
        .unwrap_or(usize::MAX)
}

#[tokio::test]
async fn changes_and_alerts_flow_through_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.alerts.rules = vec![orders_rule()];
    let pid_path = config.general.pid_file.clone();

    let mut orchestrator =
        Orchestrator::build_with_connector(config, orders_session(1..4)).unwrap();
    let store = Arc::clone(orchestrator.store());

    let probe = Arc::clone(&store);
    let reason = tokio::time::timeout(
        RUN_TIMEOUT,
        orchestrator.run_until(async move {
            assert_eq!(read_pid(Path::new(&pid_path)), Some(std::process::id()));
            wait_until(Duration::from_secs(10), "changes stored", || {
                let store = Arc::clone(&probe);
                async move { stored_changes(&store) == 3 }
            })
            .await;
            wait_until(Duration::from_secs(10), "alerts resolved", || {
                let store = Arc::clone(&probe);
                async move {
                    store.query_alerts(&AlertQuery::default()).map(|a| a.len()).unwrap_or(0) == 3
                        && pending_alerts(&store) == 0
                }
            })
            .await;
            Ok("TEST")
        }),
    )
    .await
    .expect("daemon did not stop")
    .unwrap();

    assert_eq!(reason, ExitReason::Signal("TEST"));
    assert!(!dir.path().join("run").join("binwatch.pid").exists());

    // No channel is configured, so every alert is recorded as suppressed.
    let alerts = store.query_alerts(&AlertQuery::default()).unwrap();
    assert!(alerts.iter().all(|a| a.delivery_status == DeliveryStatus::Suppressed));
    let checkpoint = orchestrator.monitor().snapshot().last_checkpoint;
    assert!(checkpoint.is_some(), "checkpoint published after the commit");
}

#[tokio::test]
async fn plugins_are_registered_producers_first() {
    let dir = tempfile::tempdir().unwrap();
    let (config, _port) = with_api(test_config(dir.path()));
    let orchestrator =
        Orchestrator::build_with_connector(config.clone(), orders_session(1..2)).unwrap();
    assert_eq!(
        orchestrator.plugin_names(),
        vec!["cdc-pipeline", "notifier", "query-api"]
    );

    let mut quiet = test_config(dir.path());
    quiet.alerts.enabled = false;
    quiet.store.path = dir.path().join("quiet.db").display().to_string();
    let orchestrator = Orchestrator::build_with_connector(quiet, orders_session(1..2)).unwrap();
    assert_eq!(orchestrator.plugin_names(), vec!["cdc-pipeline"]);
}

#[tokio::test]
async fn held_pid_file_blocks_a_second_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let held = PidFile::create(&config.general.pid_file).unwrap();

    let mut orchestrator =
        Orchestrator::build_with_connector(config, orders_session(1..2)).unwrap();
    let err = orchestrator
        .run_until(async { Ok("TEST") })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("another binwatch-daemon"), "{err}");

    // The held file is untouched.
    assert_eq!(read_pid(held.path()), Some(std::process::id()));
    held.remove();
}

#[tokio::test]
async fn health_reports_every_plugin_and_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        Orchestrator::build_with_connector(test_config(dir.path()), orders_session(1..2))
            .unwrap();
    let health = orchestrator.health().await;
    let names: Vec<&str> = health.modules.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["cdc-pipeline", "notifier", "ingestion"]);
    // Nothing started yet.
    assert!(health.status.is_unhealthy());
}
