//! Metric names and descriptions.
//!
//! Every Prometheus metric is named here; components call
//! `metrics::counter!()`, `metrics::gauge!()` and `metrics::histogram!()`
//! with these constants.
//!
//! # Naming
//!
//! - prefix: `binwatch_`
//! - component: `reader_`, `scope_`, `pipeline_`, `store_`, `rules_`, `notify_`, `daemon_`
//! - suffix: `_total` (counter), `_seconds` (histogram/latency), none (gauge)
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(binwatch_core::metrics::PIPELINE_EVENTS_TOTAL).increment(1);
//! ```

// --- label keys ---

/// Operation label key (INSERT, UPDATE, DELETE, DDL)
pub const LABEL_OPERATION: &str = "operation";

/// Severity label key
pub const LABEL_SEVERITY: &str = "severity";

/// Channel name label key
pub const LABEL_CHANNEL: &str = "channel";

/// Outcome label key (delivered, failed, suppressed)
pub const LABEL_RESULT: &str = "result";

/// Drop reason label key
pub const LABEL_REASON: &str = "reason";

// --- reader ---

/// Reader: decoded binlog events (counter)
pub const READER_EVENTS_TOTAL: &str = "binwatch_reader_events_total";

/// Reader: reconnect attempts (counter)
pub const READER_RECONNECTS_TOTAL: &str = "binwatch_reader_reconnects_total";

/// Reader: seconds between the source commit time and now (gauge)
pub const READER_LAG_SECONDS: &str = "binwatch_reader_lag_seconds";

/// Reader: state machine state as a number, see `ReaderState::code` (gauge)
pub const READER_STATE: &str = "binwatch_reader_state";

/// Reader: statement-format DML skipped (counter)
pub const READER_STATEMENT_EVENTS_SKIPPED_TOTAL: &str =
    "binwatch_reader_statement_events_skipped_total";

// --- pipeline ---

/// Pipeline: committed change events emitted (counter, label: operation)
pub const PIPELINE_EVENTS_TOTAL: &str = "binwatch_pipeline_events_total";

/// Pipeline: mutations filtered out of scope (counter, label: reason)
pub const PIPELINE_EVENTS_FILTERED_TOTAL: &str = "binwatch_pipeline_events_filtered_total";

/// Scope: unparseable DDL dropped (counter)
pub const SCOPE_UNPARSEABLE_DDL_TOTAL: &str = "binwatch_scope_unparseable_ddl_total";

/// Pipeline: transactions committed (counter)
pub const PIPELINE_COMMITS_TOTAL: &str = "binwatch_pipeline_commits_total";

/// Pipeline: transactions discarded on rollback (counter)
pub const PIPELINE_ROLLBACKS_TOTAL: &str = "binwatch_pipeline_rollbacks_total";

/// Pipeline: rows buffered in the open transaction (gauge)
pub const PIPELINE_TXN_BUFFER_ROWS: &str = "binwatch_pipeline_txn_buffer_rows";

/// Pipeline: batches waiting for the store task (gauge)
pub const PIPELINE_QUEUE_DEPTH: &str = "binwatch_pipeline_queue_depth";

/// Pipeline: time to store one committed batch (histogram, seconds)
pub const PIPELINE_BATCH_DURATION_SECONDS: &str = "binwatch_pipeline_batch_duration_seconds";

// --- store ---

/// Store: rows appended (counter)
pub const STORE_EVENTS_WRITTEN_TOTAL: &str = "binwatch_store_events_written_total";

/// Store: duplicate rows ignored on replay (counter)
pub const STORE_DUPLICATES_TOTAL: &str = "binwatch_store_duplicates_total";

/// Store: checkpoint writes (counter)
pub const STORE_CHECKPOINTS_TOTAL: &str = "binwatch_store_checkpoints_total";

// --- rules ---

/// Rules: alerts raised (counter, label: severity)
pub const RULES_ALERTS_TOTAL: &str = "binwatch_rules_alerts_total";

/// Rules: loaded rules (gauge)
pub const RULES_LOADED: &str = "binwatch_rules_loaded";

/// Rules: tracked window keys (gauge)
pub const RULES_WINDOW_KEYS: &str = "binwatch_rules_window_keys";

// --- notify ---

/// Notify: delivery outcomes (counter, labels: channel, result)
pub const NOTIFY_DELIVERIES_TOTAL: &str = "binwatch_notify_deliveries_total";

/// Notify: retried delivery attempts (counter, label: channel)
pub const NOTIFY_RETRIES_TOTAL: &str = "binwatch_notify_retries_total";

/// Notify: time spent delivering one alert to one channel (histogram, seconds)
pub const NOTIFY_DELIVERY_DURATION_SECONDS: &str = "binwatch_notify_delivery_duration_seconds";

/// Notify: alerts withheld by suppression (counter, label: reason)
pub const NOTIFY_SUPPRESSED_TOTAL: &str = "binwatch_notify_suppressed_total";

// --- daemon ---

/// Daemon: uptime (gauge, seconds)
pub const DAEMON_UPTIME_SECONDS: &str = "binwatch_daemon_uptime_seconds";

/// Daemon: registered plugins (gauge)
pub const DAEMON_PLUGINS_REGISTERED: &str = "binwatch_daemon_plugins_registered";

/// Daemon: build info (gauge, always 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "binwatch_daemon_build_info";

// --- histogram buckets ---

/// Batch store latency buckets (seconds), 100us to 10s.
pub const BATCH_DURATION_BUCKETS: [f64; 10] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0,
];

/// Register HELP text for every metric.
///
/// Call once, after the global recorder is installed.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // reader
    describe_counter!(READER_EVENTS_TOTAL, "Binlog events decoded from the source");
    describe_counter!(
        READER_RECONNECTS_TOTAL,
        "Reconnect attempts after a lost replication connection"
    );
    describe_gauge!(
        READER_LAG_SECONDS,
        "Seconds between the last processed source timestamp and now"
    );
    describe_gauge!(
        READER_STATE,
        "Reader state (0 disconnected, 1 connecting, 2 streaming, 3 draining, 4 stopped, 5 failed)"
    );
    describe_counter!(
        READER_STATEMENT_EVENTS_SKIPPED_TOTAL,
        "Statement-format DML events skipped because they carry no row images"
    );

    // pipeline
    describe_counter!(
        PIPELINE_EVENTS_TOTAL,
        "Committed change events emitted by the normalizer"
    );
    describe_counter!(
        PIPELINE_EVENTS_FILTERED_TOTAL,
        "Mutations dropped by the scope filter"
    );
    describe_counter!(
        SCOPE_UNPARSEABLE_DDL_TOTAL,
        "DDL statements dropped because their target table could not be parsed"
    );
    describe_counter!(PIPELINE_COMMITS_TOTAL, "Transactions committed");
    describe_counter!(
        PIPELINE_ROLLBACKS_TOTAL,
        "Transactions discarded because they rolled back"
    );
    describe_gauge!(
        PIPELINE_TXN_BUFFER_ROWS,
        "Rows buffered for the currently open transaction"
    );
    describe_gauge!(
        PIPELINE_QUEUE_DEPTH,
        "Committed batches waiting to be stored"
    );
    describe_histogram!(
        PIPELINE_BATCH_DURATION_SECONDS,
        "Time to durably store one committed transaction"
    );

    // store
    describe_counter!(STORE_EVENTS_WRITTEN_TOTAL, "Change events appended");
    describe_counter!(
        STORE_DUPLICATES_TOTAL,
        "Change events ignored because they were already stored"
    );
    describe_counter!(STORE_CHECKPOINTS_TOTAL, "Checkpoint writes");

    // rules
    describe_counter!(RULES_ALERTS_TOTAL, "Alerts raised by the rule engine");
    describe_gauge!(RULES_LOADED, "Alert rules currently loaded");
    describe_gauge!(RULES_WINDOW_KEYS, "Windowed rule keys currently tracked");

    // notify
    describe_counter!(
        NOTIFY_DELIVERIES_TOTAL,
        "Notification outcomes per channel"
    );
    describe_counter!(NOTIFY_RETRIES_TOTAL, "Notification delivery retries");
    describe_histogram!(
        NOTIFY_DELIVERY_DURATION_SECONDS,
        "Time to deliver one alert to one channel, retries included"
    );
    describe_counter!(
        NOTIFY_SUPPRESSED_TOTAL,
        "Alerts withheld by de-duplication or rate limiting"
    );

    // daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "binwatch daemon uptime in seconds");
    describe_gauge!(
        DAEMON_PLUGINS_REGISTERED,
        "Number of plugins registered in the daemon"
    );
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
}
