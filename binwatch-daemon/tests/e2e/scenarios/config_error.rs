//! Invalid configuration is rejected before anything is opened.

use binwatch_core::config::BinwatchConfig;
use binwatch_daemon::Orchestrator;

use crate::helpers::binlog::orders_session;
use crate::helpers::config::test_config;

#[test]
fn statement_based_binlog_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.source.binlog_format = "statement".to_owned();

    let err = Orchestrator::build_with_connector(config, orders_session(1..2))
        .err()
        .expect("statement format must be rejected");
    assert!(format!("{err:#}").contains("binlog_format"), "{err:#}");
    assert!(!dir.path().join("binwatch.db").exists());
}

#[test]
fn rule_targeting_undeclared_channel_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let mut rule = crate::helpers::binlog::orders_rule();
    rule.channels = vec!["pager".to_owned()];
    config.alerts.rules = vec![rule];

    let err = Orchestrator::build_with_connector(config, orders_session(1..2))
        .err()
        .expect("unknown channel must be rejected");
    assert!(format!("{err:#}").contains("pager"), "{err:#}");
}

#[test]
fn unknown_keys_fail_to_parse() {
    let err = BinwatchConfig::parse(
        r#"
[general]
log_level = "info"
colour = true
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("colour"), "{err}");
}
