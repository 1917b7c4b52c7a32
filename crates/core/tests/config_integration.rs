//! binwatch.toml integration tests
//!
//! - binwatch.toml.example parses and validates
//! - partial configs load with defaults
//! - environment overrides win over the file
//! - empty / malformed files

use binwatch_core::config::{
    BinwatchConfig, ChannelKind, PositionStoreKind, StaleCheckpointPolicy, StartMode,
    UnparseableDdlPolicy,
};
use binwatch_core::error::{BinwatchError, ConfigError};
use binwatch_core::types::Operation;
use serial_test::serial;

const EXAMPLE: &str = include_str!("../../../binwatch.toml.example");

#[test]
fn example_config_parses_successfully() {
    let config = BinwatchConfig::parse(EXAMPLE).expect("example config should parse");

    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.general.log_format, "json");
    assert_eq!(config.general.data_dir, "/var/lib/binwatch");
    assert!(config.general.exit_on_fatal);
}

#[test]
fn example_config_passes_validation() {
    let config = BinwatchConfig::parse(EXAMPLE).expect("should parse");
    config
        .validate()
        .expect("example config should pass validation");
}

#[test]
fn example_config_source_section() {
    let config = BinwatchConfig::parse(EXAMPLE).expect("should parse");

    assert_eq!(config.source.port, 3306);
    assert_eq!(config.source.server_id, 1001);
    assert_eq!(config.source.start_mode, StartMode::Now);
    assert_eq!(config.source.on_stale_checkpoint, StaleCheckpointPolicy::Fail);
    assert_eq!(config.source.reconnect.max_backoff_ms, 30_000);
}

#[test]
fn example_config_scope_section() {
    let config = BinwatchConfig::parse(EXAMPLE).expect("should parse");

    assert_eq!(config.scope.include.len(), 2);
    assert_eq!(config.scope.exclude.len(), 1);
    assert_eq!(config.scope.unparseable_ddl, UnparseableDdlPolicy::Drop);
    assert_eq!(config.scope.include[0].operations, Operation::ALL.to_vec());
    assert_eq!(
        config.scope.include[1].sensitive_columns,
        vec!["password_hash"]
    );
}

#[test]
fn example_config_pipeline_and_notify() {
    let config = BinwatchConfig::parse(EXAMPLE).expect("should parse");

    assert_eq!(config.pipeline.queue_depth, 1024);
    assert_eq!(config.pipeline.position_store, PositionStoreKind::Store);
    assert_eq!(config.notify.channels.len(), 2);
    assert_eq!(config.notify.channels[1].kind, ChannelKind::Webhook);
    assert!(!config.notify.channels[1].enabled);
}

#[test]
fn partial_config_only_store_section() {
    let config = BinwatchConfig::parse("[store]\npath = \"/tmp/binwatch.db\"\n").unwrap();
    assert_eq!(config.store.path, "/tmp/binwatch.db");
    assert_eq!(config.source.host, "127.0.0.1");
    assert_eq!(config.api.port, 8080);
}

#[test]
fn empty_file_yields_defaults() {
    let config = BinwatchConfig::parse("").unwrap();
    assert_eq!(config.general.log_level, "info");
    assert!(config.scope.include.is_empty());
}

#[test]
fn malformed_toml_is_parse_error() {
    let err = BinwatchConfig::parse("[source\nhost = ").unwrap_err();
    assert!(matches!(
        err,
        BinwatchError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[test]
fn wrong_value_type_is_parse_error() {
    let err = BinwatchConfig::parse("[source]\nport = \"three\"").unwrap_err();
    assert!(matches!(
        err,
        BinwatchError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[tokio::test]
#[serial]
async fn load_applies_env_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binwatch.toml");
    tokio::fs::write(&path, "[source]\nuser = \"repl\"\nhost = \"db1\"\n")
        .await
        .unwrap();

    // SAFETY: serial test, no other thread reads the environment.
    unsafe { std::env::set_var("BINWATCH_SOURCE_HOST", "db2") };
    let config = BinwatchConfig::load(&path).await;
    unsafe { std::env::remove_var("BINWATCH_SOURCE_HOST") };

    let config = config.unwrap();
    assert_eq!(config.source.host, "db2");
    assert_eq!(config.source.user, "repl");
}

#[tokio::test]
#[serial]
async fn load_rejects_statement_format() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binwatch.toml");
    tokio::fs::write(
        &path,
        "[source]\nuser = \"repl\"\nbinlog_format = \"statement\"\n",
    )
    .await
    .unwrap();

    let err = BinwatchConfig::load(&path).await.unwrap_err();
    assert!(matches!(
        err,
        BinwatchError::Config(ConfigError::InvalidValue { .. })
    ));
}
