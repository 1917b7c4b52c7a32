//! Test configuration builder.

use std::net::TcpListener;
use std::path::Path;

use binwatch_core::config::{BinwatchConfig, ReconnectConfig};

use super::binlog::FILE;

/// A valid config rooted in `dir`: PID file and store inside it, API off,
/// short backoff and drain timings.
pub fn test_config(dir: &Path) -> BinwatchConfig {
    let mut config = BinwatchConfig::default();
    config.general.pid_file = dir.join("run").join("binwatch.pid").display().to_string();
    config.general.data_dir = dir.display().to_string();
    config.source.user = "repl".to_owned();
    config.source.start_position = format!("{FILE}:4");
    config.source.reconnect = ReconnectConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        max_retries: 1,
    };
    config.pipeline.checkpoint_interval_ms = 10;
    config.pipeline.drain_grace_secs = 1;
    config.store.path = dir.join("binwatch.db").display().to_string();
    config.api.enabled = false;
    config.metrics.enabled = false;
    config
}

/// Enable the query API on a currently free loopback port.
pub fn with_api(mut config: BinwatchConfig) -> (BinwatchConfig, u16) {
    let port = TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .expect("no free port");
    config.api.enabled = true;
    config.api.listen_addr = "127.0.0.1".to_owned();
    config.api.port = port;
    (config, port)
}
