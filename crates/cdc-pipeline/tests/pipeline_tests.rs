//! End-to-end pipeline tests: scripted binlog sessions through the real
//! reader, filter, normalizer, store and rule engine.

use std::path::Path;
use std::time::Duration;

use binwatch_binlog::ReaderState;
use binwatch_binlog::decoder::ColumnType;
use binwatch_binlog::testing::{Cell, EventEncoder, ScriptedConnector};
use binwatch_cdc_pipeline::{CdcPipeline, CdcPipelineBuilder, RuleLoader};
use binwatch_core::config::{
    BinwatchConfig, ExcludeScope, IncludeScope, PositionStoreKind, ReconnectConfig,
};
use binwatch_core::plugin::Plugin;
use binwatch_core::types::{Alert, ChangeEvent, Checkpoint, Operation, StreamPosition};
use binwatch_store::{AlertQuery, ChangeQuery, ChangeStore, FilePositionStore, PositionStore};
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, watch};

const FILE: &str = "mysql-bin.000001";
const ORDERS: u64 = 70;
const USERS: u64 = 71;
const AUDIT: u64 = 72;

fn base_config(dir: &Path) -> BinwatchConfig {
    let mut config = BinwatchConfig::default();
    config.store.path = dir.join("binwatch.db").display().to_string();
    config.source.start_position = format!("{FILE}:4");
    config.source.reconnect = ReconnectConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        max_retries: 1,
    };
    config.pipeline.checkpoint_interval_ms = 10;
    config.pipeline.drain_grace_secs = 1;
    config.pipeline.position_file = dir.join("checkpoint.json").display().to_string();
    config
}

fn preamble(enc: &mut EventEncoder) -> Vec<Bytes> {
    vec![enc.fake_rotate(FILE, 4), enc.format_description()]
}

fn orders_map(enc: &mut EventEncoder) -> Bytes {
    enc.table_map(
        ORDERS,
        "shop",
        "orders",
        &[(ColumnType::Long, 0), (ColumnType::Varchar, 255)],
        Some(&["id", "status"]),
    )
}

fn insert_orders(enc: &mut EventEncoder, ids: std::ops::Range<i64>, xid: u64) -> Vec<Bytes> {
    let rows: Vec<Vec<Cell>> = ids.map(|id| vec![Cell::Int(id), Cell::from("new")]).collect();
    vec![
        enc.begin(),
        orders_map(enc),
        enc.write_rows(ORDERS, &rows),
        enc.xid(xid),
    ]
}

async fn started(
    config: BinwatchConfig,
    events: Vec<Bytes>,
) -> (
    CdcPipeline<ScriptedConnector>,
    Option<mpsc::Receiver<Alert>>,
) {
    let connector = ScriptedConnector::new().with_session(events);
    let (mut pipeline, alert_rx) = CdcPipelineBuilder::new(config, connector).build().unwrap();
    pipeline.init().await.unwrap();
    pipeline.start().await.unwrap();
    (pipeline, alert_rx)
}

async fn wait_for_checkpoint(
    mut rx: watch::Receiver<Option<Checkpoint>>,
    target: &StreamPosition,
) -> Checkpoint {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(cp) = rx.borrow_and_update().clone() {
                if &cp.position >= target {
                    return cp;
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("checkpoint not reached in time")
}

fn changes(store: &ChangeStore, table: &str) -> Vec<ChangeEvent> {
    store
        .query_changes(&ChangeQuery {
            table: Some(table.to_owned()),
            limit: 5000,
            ..ChangeQuery::default()
        })
        .unwrap()
}

#[tokio::test]
async fn committed_update_is_stored_masked_and_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scope.include = vec![IncludeScope {
        database: "shop".to_owned(),
        table: "users".to_owned(),
        sensitive_columns: vec!["email".to_owned()],
        ..IncludeScope::default()
    }];

    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.push(enc.begin());
    events.push(enc.table_map(
        USERS,
        "shop",
        "users",
        &[(ColumnType::Long, 0), (ColumnType::Varchar, 255)],
        Some(&["id", "email"]),
    ));
    events.push(enc.update_rows(
        USERS,
        &[(
            vec![Cell::Int(7), Cell::from("old@example.com")],
            vec![Cell::Int(7), Cell::from("new@example.com")],
        )],
    ));
    events.push(enc.xid(1));
    let commit = enc.position();

    let (mut pipeline, _alerts) = started(config, events).await;
    let cp = wait_for_checkpoint(pipeline.checkpoints(), &commit).await;
    assert!(cp.tx_boundary);

    let stored = changes(pipeline.store(), "users");
    assert_eq!(stored.len(), 1);
    let event = &stored[0];
    assert_eq!(event.operation, Operation::Update);
    assert_eq!(event.qualified_table(), "shop.users");
    assert_eq!(event.primary_key.get("id"), Some(&json!(7)));
    assert!(event.committed);
    assert!(event.changes.contains_key("email"));
    let after = event.after.as_ref().unwrap();
    assert_eq!(after.get("email"), Some(&json!("ne***@example.com")));

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.status().state, ReaderState::Stopped);
    // the durable slot holds the same checkpoint
    assert_eq!(pipeline.store().load().unwrap().unwrap().position, commit);
}

#[tokio::test]
async fn rolled_back_transaction_leaves_no_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.push(enc.begin());
    events.push(orders_map(&mut enc));
    events.push(enc.write_rows(ORDERS, &[vec![Cell::Int(1), Cell::from("lost")]]));
    events.push(enc.query("shop", "ROLLBACK"));
    events.extend(insert_orders(&mut enc, 2..3, 2));
    let commit = enc.position();

    let (mut pipeline, _alerts) = started(base_config(dir.path()), events).await;
    wait_for_checkpoint(pipeline.checkpoints(), &commit).await;

    let stored = changes(pipeline.store(), "shop.orders");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].primary_key.get("id"), Some(&json!(2)));
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn exclusion_wins_over_more_specific_include() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scope.include = vec![
        IncludeScope {
            database: "shop".to_owned(),
            table: "*".to_owned(),
            ..IncludeScope::default()
        },
        IncludeScope {
            database: "shop".to_owned(),
            table: "audit_log".to_owned(),
            ..IncludeScope::default()
        },
    ];
    config.scope.exclude = vec![ExcludeScope {
        database: "shop".to_owned(),
        table: "audit_log".to_owned(),
        ..ExcludeScope::default()
    }];

    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.push(enc.begin());
    events.push(orders_map(&mut enc));
    events.push(enc.write_rows(ORDERS, &[vec![Cell::Int(1), Cell::from("new")]]));
    events.push(enc.table_map(
        AUDIT,
        "shop",
        "audit_log",
        &[(ColumnType::Long, 0), (ColumnType::Varchar, 255)],
        Some(&["id", "action"]),
    ));
    events.push(enc.write_rows(AUDIT, &[vec![Cell::Int(1), Cell::from("insert")]]));
    events.push(enc.xid(1));
    let commit = enc.position();

    let (mut pipeline, _alerts) = started(config, events).await;
    wait_for_checkpoint(pipeline.checkpoints(), &commit).await;

    assert_eq!(changes(pipeline.store(), "shop.orders").len(), 1);
    assert!(changes(pipeline.store(), "shop.audit_log").is_empty());
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn standalone_ddl_is_stored_with_user() {
    let dir = tempfile::tempdir().unwrap();
    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.push(enc.query_as(
        "shop",
        "ALTER TABLE orders ADD COLUMN note TEXT",
        "admin",
        "localhost",
    ));
    let after_ddl = enc.position();

    let (mut pipeline, _alerts) = started(base_config(dir.path()), events).await;
    wait_for_checkpoint(pipeline.checkpoints(), &after_ddl).await;

    let stored = changes(pipeline.store(), "shop.orders");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].operation, Operation::Ddl);
    assert_eq!(stored[0].user.as_deref(), Some("admin@localhost"));
    let ddl = stored[0].ddl.as_ref().unwrap();
    assert!(ddl.statement.starts_with("ALTER TABLE"));
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn bulk_insert_fires_windowed_rule_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    let rule = RuleLoader::parse_yaml(
        r#"
id: orders_bulk_insert
title: Bulk insert on orders
severity: high
detection:
  conditions:
    - field: qualified_table
      value: shop.orders
    - field: operation
      value: INSERT
  window:
    threshold: 1000
    seconds: 60
    cooldown_secs: 300
"#,
        "inline",
    )
    .unwrap();
    config.alerts.rules = vec![rule];

    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.extend(insert_orders(&mut enc, 0..1050, 1));
    let commit = enc.position();

    let (mut pipeline, alerts) = started(config, events).await;
    let mut alerts = alerts.unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
        .await
        .expect("alert not raised in time")
        .unwrap();
    assert_eq!(alert.rule_id, "orders_bulk_insert");
    let window = alert.window.as_ref().unwrap();
    assert_eq!(window.count, 1001);
    assert_eq!(window.group_key, "shop.orders");

    wait_for_checkpoint(pipeline.checkpoints(), &commit).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), alerts.recv())
            .await
            .is_err(),
        "the remaining 49 rows must not fire again"
    );

    pipeline.stop().await.unwrap();
    let stored = pipeline.store().query_alerts(&AlertQuery::default()).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(changes(pipeline.store(), "shop.orders").len(), 1050);
}

#[tokio::test]
async fn redelivered_transaction_is_stored_and_alerted_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.pipeline.position_store = PositionStoreKind::File;
    config.alerts.rules = vec![
        RuleLoader::parse_yaml(
            r#"
id: orders_insert
title: Insert on orders
severity: low
detection:
  conditions:
    - field: table
      value: orders
"#,
            "inline",
        )
        .unwrap(),
    ];

    let session = || {
        let mut enc = EventEncoder::new(FILE);
        let mut events = preamble(&mut enc);
        events.extend(insert_orders(&mut enc, 1..2, 1));
        (events, enc.position())
    };

    let (events, commit) = session();
    let (mut first, alerts) = started(config.clone(), events).await;
    let mut alerts = alerts.unwrap();
    wait_for_checkpoint(first.checkpoints(), &commit).await;
    assert!(alerts.recv().await.is_some());
    first.stop().await.unwrap();
    drop(first);

    // crash between the store commit and the checkpoint file write
    let slot = FilePositionStore::new(&config.pipeline.position_file);
    assert_eq!(slot.load().unwrap().unwrap().position, commit);
    std::fs::remove_file(&config.pipeline.position_file).unwrap();

    let (events, commit) = session();
    let (mut second, alerts) = started(config.clone(), events).await;
    let mut alerts = alerts.unwrap();
    wait_for_checkpoint(second.checkpoints(), &commit).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), alerts.recv())
            .await
            .is_err()
    );

    assert_eq!(changes(second.store(), "shop.orders").len(), 1);
    let stored = second.store().query_alerts(&AlertQuery::default()).unwrap();
    assert_eq!(stored.len(), 1);
    second.stop().await.unwrap();
    assert_eq!(slot.load().unwrap().unwrap().position, commit);
}

#[tokio::test]
async fn stop_abandons_open_transaction_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.push(enc.begin());
    events.push(orders_map(&mut enc));
    events.push(enc.write_rows(ORDERS, &[vec![Cell::Int(1), Cell::from("new")]]));

    let (mut pipeline, _alerts) = started(base_config(dir.path()), events).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), pipeline.stop())
        .await
        .expect("drain exceeded its grace period")
        .unwrap();

    assert!(changes(pipeline.store(), "shop.orders").is_empty());
    assert!(pipeline.store().load().unwrap().is_none());
    assert_eq!(pipeline.status().state, ReaderState::Stopped);
}

#[tokio::test]
async fn oversized_transaction_halts_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.pipeline.max_transaction_rows = 2;

    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.extend(insert_orders(&mut enc, 1..4, 1));

    let (mut pipeline, _alerts) = started(config, events).await;
    let mut fatal = pipeline.fatal();
    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(reason) = fatal.borrow_and_update().clone() {
                return reason;
            }
            fatal.changed().await.unwrap();
        }
    })
    .await
    .expect("fatal error not raised");
    assert!(reason.contains("2"), "unexpected reason: {reason}");

    assert!(pipeline.health_check().await.is_unhealthy());
    assert_eq!(pipeline.status().state, ReaderState::Failed);
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.status().state, ReaderState::Failed);
    assert!(changes(pipeline.store(), "shop.orders").is_empty());
}

#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());

    let mut enc = EventEncoder::new(FILE);
    let mut events = preamble(&mut enc);
    events.extend(insert_orders(&mut enc, 1..2, 1));
    let commit = enc.position();

    let (mut first, _alerts) = started(config.clone(), events).await;
    wait_for_checkpoint(first.checkpoints(), &commit).await;
    first.stop().await.unwrap();
    drop(first);

    let connector = ScriptedConnector::new().with_session(Vec::new());
    let (mut second, _alerts) = CdcPipelineBuilder::new(config, connector.clone())
        .build()
        .unwrap();
    second.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while connector.connects().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(connector.connects()[0], commit);
    second.stop().await.unwrap();
}
