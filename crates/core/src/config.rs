//! Configuration: `binwatch.toml` parsing, environment overrides, validation.
//!
//! [`BinwatchConfig`] is the top-level structure; each component reads its
//! own section. Every struct rejects unknown keys so a typo fails at load
//! time instead of silently falling back to a default.
//!
//! # Precedence
//! 1. CLI flags (highest)
//! 2. Environment variables (`BINWATCH_SOURCE_PASSWORD=...`)
//! 3. Config file
//! 4. Defaults
//!
//! ```no_run
//! # async fn example() -> Result<(), binwatch_core::error::BinwatchError> {
//! use binwatch_core::config::BinwatchConfig;
//!
//! let config = BinwatchConfig::load("binwatch.toml").await?;
//! let config = BinwatchConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BinwatchError, ConfigError};
use crate::rule::AlertRule;
use crate::types::{Operation, Severity, StreamPosition};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BinwatchConfig {
    pub general: GeneralConfig,
    pub source: SourceConfig,
    pub scope: ScopeConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub alerts: AlertsConfig,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

impl BinwatchConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BinwatchError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file without environment overrides or validation.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, BinwatchError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BinwatchError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                BinwatchError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, BinwatchError> {
        toml::from_str(toml_str).map_err(|e| {
            BinwatchError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Apply `BINWATCH_{SECTION}_{FIELD}` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        // general
        override_string(&mut self.general.log_level, "BINWATCH_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "BINWATCH_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.data_dir, "BINWATCH_GENERAL_DATA_DIR");
        override_string(&mut self.general.pid_file, "BINWATCH_GENERAL_PID_FILE");
        override_bool(
            &mut self.general.exit_on_fatal,
            "BINWATCH_GENERAL_EXIT_ON_FATAL",
        );

        // source
        override_string(&mut self.source.host, "BINWATCH_SOURCE_HOST");
        override_u16(&mut self.source.port, "BINWATCH_SOURCE_PORT");
        override_string(&mut self.source.user, "BINWATCH_SOURCE_USER");
        override_string(&mut self.source.password, "BINWATCH_SOURCE_PASSWORD");
        override_u32(&mut self.source.server_id, "BINWATCH_SOURCE_SERVER_ID");
        override_string(
            &mut self.source.start_position,
            "BINWATCH_SOURCE_START_POSITION",
        );

        // pipeline
        override_usize(
            &mut self.pipeline.queue_depth,
            "BINWATCH_PIPELINE_QUEUE_DEPTH",
        );
        override_usize(
            &mut self.pipeline.max_transaction_rows,
            "BINWATCH_PIPELINE_MAX_TRANSACTION_ROWS",
        );
        override_string(
            &mut self.pipeline.position_file,
            "BINWATCH_PIPELINE_POSITION_FILE",
        );

        // store
        override_string(&mut self.store.path, "BINWATCH_STORE_PATH");

        // alerts / notify
        override_bool(&mut self.alerts.enabled, "BINWATCH_ALERTS_ENABLED");
        override_string(&mut self.alerts.rule_dir, "BINWATCH_ALERTS_RULE_DIR");
        override_bool(&mut self.notify.enabled, "BINWATCH_NOTIFY_ENABLED");
        override_csv(
            &mut self.notify.default_channels,
            "BINWATCH_NOTIFY_DEFAULT_CHANNELS",
        );

        // api
        override_bool(&mut self.api.enabled, "BINWATCH_API_ENABLED");
        override_string(&mut self.api.listen_addr, "BINWATCH_API_LISTEN_ADDR");
        override_u16(&mut self.api.port, "BINWATCH_API_PORT");

        // metrics
        override_bool(&mut self.metrics.enabled, "BINWATCH_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "BINWATCH_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "BINWATCH_METRICS_PORT");
    }

    /// Validate every section. All configuration errors surface here.
    pub fn validate(&self) -> Result<(), BinwatchError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        self.source.validate()?;
        self.scope.validate()?;
        self.pipeline.validate()?;

        if self.store.path.is_empty() {
            return Err(invalid("store.path", "must not be empty"));
        }

        self.notify.validate()?;
        self.validate_alert_rules()?;

        if self.api.enabled && self.api.default_limit > self.api.max_limit {
            return Err(invalid("api.default_limit", "must not exceed api.max_limit"));
        }
        if self.api.max_limit == 0 {
            return Err(invalid("api.max_limit", "must be greater than 0"));
        }

        if self.metrics.enabled && self.metrics.endpoint != "/metrics" {
            return Err(invalid(
                "metrics.endpoint",
                "only '/metrics' is supported",
            ));
        }

        Ok(())
    }

    fn validate_alert_rules(&self) -> Result<(), BinwatchError> {
        let channel_names: HashSet<&str> = self
            .notify
            .channels
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let mut seen = HashSet::new();

        for rule in &self.alerts.rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid(
                    "alerts.rules",
                    format!("duplicate rule id '{}'", rule.id),
                ));
            }
            self.check_rule_channels(rule, &channel_names)?;
        }
        Ok(())
    }

    /// Rules may only target channels declared under `[[notify.channels]]`.
    pub fn check_rule_channels(
        &self,
        rule: &AlertRule,
        channel_names: &HashSet<&str>,
    ) -> Result<(), BinwatchError> {
        for channel in &rule.channels {
            if !channel_names.contains(channel.as_str()) {
                return Err(invalid(
                    &format!("alerts.rules[{}].channels", rule.id),
                    format!("unknown channel '{channel}'"),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> BinwatchError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// Compile a scope glob (`*`, `?`, `[abc]`), case-insensitively.
pub fn compile_glob(field: &str, pattern: &str) -> Result<GlobMatcher, ConfigError> {
    if pattern.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.to_owned(),
            reason: "pattern must not be empty".to_owned(),
        });
    }
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| ConfigError::InvalidValue {
            field: field.to_owned(),
            reason: format!("invalid pattern '{pattern}': {e}"),
        })
}

// --- general ---

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
    pub data_dir: String,
    /// Empty disables the PID file.
    pub pid_file: String,
    /// Exit non-zero when ingestion hits a fatal error. When false the
    /// daemon keeps serving queries with an unhealthy indicator.
    pub exit_on_fatal: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            data_dir: "/var/lib/binwatch".to_owned(),
            pid_file: "/var/run/binwatch/binwatch.pid".to_owned(),
            exit_on_fatal: true,
        }
    }
}

// --- source ---

/// Where to start when no checkpoint exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Current end of the log.
    #[default]
    Now,
    /// Oldest retained log file.
    Earliest,
}

/// What to do when the checkpoint has been purged from the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleCheckpointPolicy {
    /// Halt ingestion; an operator must re-seed the checkpoint.
    #[default]
    Fail,
    /// Restart from the current end of the log, accepting a gap.
    RestartFromNow,
}

/// Replication source connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    /// Needs REPLICATION SLAVE, REPLICATION CLIENT and SELECT.
    pub user: String,
    pub password: String,
    /// Replica id announced to the source; must be unique in the topology.
    pub server_id: u32,
    pub start_mode: StartMode,
    /// Explicit cold-start position `file:offset`; overrides `start_mode`.
    pub start_position: String,
    /// Only `row` is supported.
    pub binlog_format: String,
    pub connect_timeout_secs: u64,
    /// Heartbeat period requested from the source; 0 disables.
    pub heartbeat_secs: u64,
    /// No bytes for this long means the connection is dead.
    pub read_timeout_secs: u64,
    /// Look up column names in information_schema when the log lacks them.
    pub resolve_column_names: bool,
    pub on_stale_checkpoint: StaleCheckpointPolicy,
    pub reconnect: ReconnectConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            server_id: 1001,
            start_mode: StartMode::Now,
            start_position: String::new(),
            binlog_format: "row".to_owned(),
            connect_timeout_secs: 10,
            heartbeat_secs: 30,
            read_timeout_secs: 120,
            resolve_column_names: true,
            on_stale_checkpoint: StaleCheckpointPolicy::Fail,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SourceConfig {
    /// Parsed `start_position`, if set.
    pub fn explicit_start(&self) -> Result<Option<StreamPosition>, BinwatchError> {
        if self.start_position.trim().is_empty() {
            return Ok(None);
        }
        self.start_position
            .parse::<StreamPosition>()
            .map(Some)
            .map_err(|e| invalid("source.start_position", e.to_string()))
    }

    fn validate(&self) -> Result<(), BinwatchError> {
        if self.host.is_empty() {
            return Err(invalid("source.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("source.port", "must not be 0"));
        }
        if self.user.is_empty() {
            return Err(invalid(
                "source.user",
                "replication credentials are required",
            ));
        }
        if self.server_id == 0 {
            return Err(invalid("source.server_id", "must not be 0"));
        }
        match self.binlog_format.to_ascii_lowercase().as_str() {
            "row" => {}
            "statement" | "mixed" => {
                return Err(invalid(
                    "source.binlog_format",
                    "statement-based logging cannot provide before/after row images; only 'row' is supported",
                ));
            }
            _ => return Err(invalid("source.binlog_format", "must be 'row'")),
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("source.connect_timeout_secs", "must be greater than 0"));
        }
        if self.heartbeat_secs > 0 && self.read_timeout_secs <= self.heartbeat_secs {
            return Err(invalid(
                "source.read_timeout_secs",
                "must be greater than heartbeat_secs",
            ));
        }
        self.explicit_start()?;
        self.reconnect.validate()
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 0 = retry forever.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_retries: 0,
        }
    }
}

impl ReconnectConfig {
    fn validate(&self) -> Result<(), BinwatchError> {
        if self.initial_backoff_ms == 0 {
            return Err(invalid(
                "source.reconnect.initial_backoff_ms",
                "must be greater than 0",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                "source.reconnect.max_backoff_ms",
                "must be >= initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

// --- scope ---

/// Handling of DDL whose target table cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnparseableDdlPolicy {
    /// Drop and count.
    #[default]
    Drop,
    /// Pass downstream as an unscoped DDL event.
    Surface,
}

/// Database/table scopes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    /// No include rules = everything not excluded is in scope.
    pub include: Vec<IncludeScope>,
    pub exclude: Vec<ExcludeScope>,
    pub unparseable_ddl: UnparseableDdlPolicy,
}

impl ScopeConfig {
    fn validate(&self) -> Result<(), BinwatchError> {
        for (i, rule) in self.include.iter().enumerate() {
            compile_glob(&format!("scope.include[{i}].database"), &rule.database)?;
            compile_glob(&format!("scope.include[{i}].table"), &rule.table)?;
            if rule.primary_key.iter().any(|c| c.is_empty()) {
                return Err(invalid(
                    &format!("scope.include[{i}].primary_key"),
                    "column names must not be empty",
                ));
            }
        }
        for (i, rule) in self.exclude.iter().enumerate() {
            compile_glob(&format!("scope.exclude[{i}].database"), &rule.database)?;
            compile_glob(&format!("scope.exclude[{i}].table"), &rule.table)?;
        }
        Ok(())
    }
}

/// Inclusion scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IncludeScope {
    /// Glob.
    pub database: String,
    /// Glob.
    pub table: String,
    /// Empty = all operations.
    pub operations: Vec<Operation>,
    /// Mutations by these accounts are not admitted by this scope.
    pub exclude_users: Vec<String>,
    /// Key columns used for `primary_key` and record history.
    pub primary_key: Vec<String>,
    /// When non-empty, row images keep only these columns (plus the key).
    pub track_columns: Vec<String>,
    /// Columns masked before storage.
    pub sensitive_columns: Vec<String>,
}

impl Default for IncludeScope {
    fn default() -> Self {
        Self {
            database: "*".to_owned(),
            table: "*".to_owned(),
            operations: Vec::new(),
            exclude_users: Vec::new(),
            primary_key: vec!["id".to_owned()],
            track_columns: Vec::new(),
            sensitive_columns: Vec::new(),
        }
    }
}

/// Exclusion scope. Always wins over any inclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExcludeScope {
    pub database: String,
    pub table: String,
    /// Empty = all operations.
    pub operations: Vec<Operation>,
    /// Empty = every account; otherwise only these.
    pub users: Vec<String>,
}

impl Default for ExcludeScope {
    fn default() -> Self {
        Self {
            database: "*".to_owned(),
            table: "*".to_owned(),
            operations: Vec::new(),
            users: Vec::new(),
        }
    }
}

// --- pipeline ---

/// Where checkpoints are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStoreKind {
    /// Same SQLite database and transaction as the change batch.
    #[default]
    Store,
    /// Separate JSON file, written after the batch commits.
    File,
}

/// Pipeline limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue.
    pub queue_depth: usize,
    /// Buffered rows per transaction before the stream is failed.
    pub max_transaction_rows: usize,
    /// How long shutdown waits for an open transaction's COMMIT.
    pub drain_grace_secs: u64,
    /// Minimum spacing of checkpoint writes for transactions with no
    /// in-scope events.
    pub checkpoint_interval_ms: u64,
    pub position_store: PositionStoreKind,
    pub position_file: String,
    /// Replication lag above which health turns degraded.
    pub lag_degraded_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            max_transaction_rows: 100_000,
            drain_grace_secs: 5,
            checkpoint_interval_ms: 1000,
            position_store: PositionStoreKind::Store,
            position_file: "/var/lib/binwatch/checkpoint.json".to_owned(),
            lag_degraded_secs: 60,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), BinwatchError> {
        if self.queue_depth == 0 {
            return Err(invalid("pipeline.queue_depth", "must be greater than 0"));
        }
        if self.max_transaction_rows == 0 {
            return Err(invalid(
                "pipeline.max_transaction_rows",
                "must be greater than 0",
            ));
        }
        if self.position_store == PositionStoreKind::File && self.position_file.is_empty() {
            return Err(invalid(
                "pipeline.position_file",
                "required when position_store = \"file\"",
            ));
        }
        Ok(())
    }
}

// --- store ---

/// Change store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database path.
    pub path: String,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/binwatch/binwatch.db".to_owned(),
            busy_timeout_ms: 5000,
        }
    }
}

// --- alerts ---

/// Rule engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    pub enabled: bool,
    /// Directory of `*.yml` / `*.yaml` rule files; empty disables.
    pub rule_dir: String,
    /// Inline rules.
    pub rules: Vec<AlertRule>,
    /// Upper bound on tracked (rule, key) windows.
    pub max_window_keys: usize,
    /// Replay recent stored events into windows on start.
    pub rebuild_on_start: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rule_dir: String::new(),
            rules: Vec::new(),
            max_window_keys: 100_000,
            rebuild_on_start: true,
        }
    }
}

// --- notify ---

/// Channel transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Log,
    Webhook,
    Email,
}

/// One notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    /// Alerts below this severity are not sent here.
    pub min_severity: Severity,
    pub timeout_secs: u64,

    // webhook
    pub url: String,
    pub headers: BTreeMap<String, String>,

    // email
    pub smtp_host: String,
    pub smtp_port: u16,
    pub starttls: bool,
    pub username: String,
    pub password: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub subject_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ChannelKind::Log,
            enabled: true,
            min_severity: Severity::Info,
            timeout_secs: 10,
            url: String::new(),
            headers: BTreeMap::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            starttls: true,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            recipients: Vec::new(),
            subject_prefix: "[binwatch]".to_owned(),
        }
    }
}

impl ChannelConfig {
    fn validate(&self, idx: usize) -> Result<(), BinwatchError> {
        let field = |name: &str| format!("notify.channels[{idx}].{name}");
        if self.name.is_empty() {
            return Err(invalid(&field("name"), "must not be empty"));
        }
        match self.kind {
            ChannelKind::Log => {}
            ChannelKind::Webhook => {
                if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
                    return Err(invalid(&field("url"), "webhook needs an http(s) URL"));
                }
            }
            ChannelKind::Email => {
                if self.smtp_host.is_empty() {
                    return Err(invalid(&field("smtp_host"), "email needs an SMTP host"));
                }
                if !self.from.contains('@') {
                    return Err(invalid(&field("from"), "email needs a sender address"));
                }
                if self.recipients.is_empty() || self.recipients.iter().any(|r| !r.contains('@'))
                {
                    return Err(invalid(
                        &field("recipients"),
                        "email needs at least one valid recipient",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub enabled: bool,
    /// Identical (rule id, key) alerts inside this window are suppressed.
    pub suppression_window_secs: u64,
    /// Deliveries per rule per minute; 0 = unlimited.
    pub rate_limit_per_rule: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Used for rules that do not name channels.
    pub default_channels: Vec<String>,
    pub channels: Vec<ChannelConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window_secs: 300,
            rate_limit_per_rule: 30,
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            default_channels: Vec::new(),
            channels: Vec::new(),
        }
    }
}

impl NotifyConfig {
    fn validate(&self) -> Result<(), BinwatchError> {
        if self.max_attempts == 0 {
            return Err(invalid("notify.max_attempts", "must be greater than 0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                "notify.max_backoff_ms",
                "must be >= initial_backoff_ms",
            ));
        }
        let mut names = HashSet::new();
        for (i, channel) in self.channels.iter().enumerate() {
            channel.validate(i)?;
            if !names.insert(channel.name.as_str()) {
                return Err(invalid(
                    "notify.channels",
                    format!("duplicate channel name '{}'", channel.name),
                ));
            }
        }
        for name in &self.default_channels {
            if !names.contains(name.as_str()) {
                return Err(invalid(
                    "notify.default_channels",
                    format!("unknown channel '{name}'"),
                ));
            }
        }
        Ok(())
    }
}

// --- api / metrics ---

/// Read-only query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1".to_owned(),
            port: 8080,
            default_limit: 100,
            max_limit: 10_000,
        }
    }
}

/// Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
