//! `binwatch config` handler.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use binwatch_core::config::BinwatchConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const REDACTED: &str = "***REDACTED***";

const SECTIONS: &[&str] = &[
    "general", "source", "scope", "pipeline", "store", "alerts", "notify", "api", "metrics",
];

pub async fn execute(
    args: ConfigArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(config_path, writer).await,
        ConfigAction::Show { section } => execute_show(config_path, section, writer).await,
    }
}

/// Load, apply env overrides and validate; the report is printed either way.
async fn execute_validate(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    info!(path = %config_path.display(), "validating configuration");

    let report = match BinwatchConfig::load(config_path).await {
        Ok(config) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: true,
            errors: Vec::new(),
            summary: Some(ConfigSummary::from(&config)),
        },
        Err(e) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: false,
            errors: vec![e.to_string()],
            summary: None,
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

async fn execute_show(
    config_path: &Path,
    section: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let mut config = BinwatchConfig::load(config_path).await?;
    redact_credentials(&mut config);

    let report = ConfigReport::build(config_path, &config, section.as_deref())?;
    writer.render(&report)?;
    Ok(())
}

/// Blank out the replication password, SMTP passwords and webhook header
/// values (which commonly carry bearer tokens).
pub fn redact_credentials(config: &mut BinwatchConfig) {
    redact(&mut config.source.password);
    for channel in &mut config.notify.channels {
        redact(&mut channel.password);
        for value in channel.headers.values_mut() {
            redact(value);
        }
    }
}

fn redact(secret: &mut String) {
    if !secret.is_empty() {
        *secret = REDACTED.to_owned();
    }
}

/// Effective configuration, whole or one section.
#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub config: serde_json::Value,
    #[serde(skip)]
    pub config_toml: String,
}

impl ConfigReport {
    pub fn build(
        path: &Path,
        config: &BinwatchConfig,
        section: Option<&str>,
    ) -> Result<Self, CliError> {
        let Some(section) = section else {
            return Ok(Self {
                source: path.display().to_string(),
                section: None,
                config: serde_json::to_value(config)?,
                config_toml: to_toml(config),
            });
        };

        let (value, toml) = match section {
            "general" => (serde_json::to_value(&config.general)?, to_toml(&config.general)),
            "source" => (serde_json::to_value(&config.source)?, to_toml(&config.source)),
            "scope" => (serde_json::to_value(&config.scope)?, to_toml(&config.scope)),
            "pipeline" => (serde_json::to_value(&config.pipeline)?, to_toml(&config.pipeline)),
            "store" => (serde_json::to_value(&config.store)?, to_toml(&config.store)),
            "alerts" => (serde_json::to_value(&config.alerts)?, to_toml(&config.alerts)),
            "notify" => (serde_json::to_value(&config.notify)?, to_toml(&config.notify)),
            "api" => (serde_json::to_value(&config.api)?, to_toml(&config.api)),
            "metrics" => (serde_json::to_value(&config.metrics)?, to_toml(&config.metrics)),
            other => {
                return Err(CliError::Command(format!(
                    "unknown section: {other} (expected one of: {})",
                    SECTIONS.join(", ")
                )));
            }
        };

        Ok(Self {
            source: path.display().to_string(),
            section: Some(section.to_owned()),
            config: value,
            config_toml: toml,
        })
    }
}

fn to_toml<T: Serialize>(value: &T) -> String {
    toml::to_string_pretty(value).unwrap_or_else(|e| format!("(serialization error: {e})\n"))
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        match &self.section {
            Some(section) => writeln!(
                w,
                "Configuration {} (source: {})",
                format!("[{section}]").bold(),
                self.source
            )?,
            None => writeln!(w, "Configuration (source: {})", self.source.bold())?,
        }
        writeln!(w)?;
        write!(w, "{}", self.config_toml)
    }
}

/// Headline settings shown after a successful validation.
#[derive(Serialize)]
pub struct ConfigSummary {
    pub source: String,
    pub store: String,
    pub position_store: String,
    pub inline_rules: usize,
    pub rule_dir: Option<String>,
    pub channels: Vec<String>,
    pub api: Option<String>,
}

impl From<&BinwatchConfig> for ConfigSummary {
    fn from(config: &BinwatchConfig) -> Self {
        Self {
            source: format!(
                "{}@{}:{} (server_id {})",
                config.source.user, config.source.host, config.source.port, config.source.server_id
            ),
            store: config.store.path.clone(),
            position_store: match config.pipeline.position_store {
                binwatch_core::config::PositionStoreKind::Store => "store".to_owned(),
                binwatch_core::config::PositionStoreKind::File => {
                    format!("file ({})", config.pipeline.position_file)
                }
            },
            inline_rules: config.alerts.rules.len(),
            rule_dir: (!config.alerts.rule_dir.is_empty()).then(|| config.alerts.rule_dir.clone()),
            channels: config
                .notify
                .channels
                .iter()
                .map(|c| c.name.clone())
                .collect(),
            api: config
                .api
                .enabled
                .then(|| format!("{}:{}", config.api.listen_addr, config.api.port)),
        }
    }
}

#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ConfigSummary>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Config Validation: {}", self.source.bold())?;
        if !self.valid {
            writeln!(w, "  Result: {}", "INVALID".red().bold())?;
            for err in &self.errors {
                writeln!(w, "  Error: {}", err.red())?;
            }
            return Ok(());
        }

        writeln!(w, "  Result: {}", "VALID".green().bold())?;
        if let Some(s) = &self.summary {
            writeln!(w, "  Source:    {}", s.source)?;
            writeln!(w, "  Store:     {}", s.store)?;
            writeln!(w, "  Checkpoint: {}", s.position_store)?;
            writeln!(
                w,
                "  Rules:     {} inline{}",
                s.inline_rules,
                s.rule_dir
                    .as_deref()
                    .map(|d| format!(", directory {d}"))
                    .unwrap_or_default()
            )?;
            if s.channels.is_empty() {
                writeln!(w, "  Channels:  {}", "none (alerts are recorded only)".dimmed())?;
            } else {
                writeln!(w, "  Channels:  {}", s.channels.join(", "))?;
            }
            writeln!(w, "  API:       {}", s.api.as_deref().unwrap_or("disabled"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::config::{ChannelConfig, ChannelKind};

    fn config() -> BinwatchConfig {
        let mut config = BinwatchConfig::default();
        config.source.user = "repl".to_owned();
        config.source.password = "hunter2".to_owned();
        config.notify.channels.push(ChannelConfig {
            name: "ops".to_owned(),
            kind: ChannelKind::Webhook,
            url: "https://hooks.example.com/x".to_owned(),
            headers: [("Authorization".to_owned(), "Bearer abc".to_owned())].into(),
            ..ChannelConfig::default()
        });
        config
    }

    #[test]
    fn secrets_are_redacted() {
        let mut config = config();
        redact_credentials(&mut config);
        assert_eq!(config.source.password, REDACTED);
        assert_eq!(config.notify.channels[0].headers["Authorization"], REDACTED);
        // nothing to hide
        assert_eq!(config.notify.channels[0].password, "");
    }

    #[test]
    fn section_report_contains_only_that_section() {
        let mut config = config();
        redact_credentials(&mut config);
        let report =
            ConfigReport::build(Path::new("/etc/binwatch/binwatch.toml"), &config, Some("source"))
                .unwrap();
        assert_eq!(report.section.as_deref(), Some("source"));
        assert!(report.config_toml.contains("user = \"repl\""));
        assert!(!report.config_toml.contains("hunter2"));
        assert!(!report.config_toml.contains("[api]"));
        assert_eq!(report.config["server_id"], 1001);
    }

    #[test]
    fn full_report_serializes_every_section() {
        let report = ConfigReport::build(Path::new("b.toml"), &config(), None).unwrap();
        for section in SECTIONS {
            assert!(report.config.get(section).is_some(), "missing {section}");
        }
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("config_toml").is_none());
    }

    #[test]
    fn unknown_section_is_rejected() {
        let err = ConfigReport::build(Path::new("b.toml"), &config(), Some("ebpf")).unwrap_err();
        assert!(err.to_string().contains("unknown section: ebpf"));
    }

    #[test]
    fn validation_report_lists_errors() {
        let report = ConfigValidationReport {
            source: "b.toml".to_owned(),
            valid: false,
            errors: vec!["source.binlog_format: only 'row' is supported".to_owned()],
            summary: None,
        };
        let mut buf = Vec::new();
        report.render_text(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("INVALID"));
        assert!(out.contains("binlog_format"));
    }

    #[test]
    fn summary_describes_the_setup() {
        let summary = ConfigSummary::from(&config());
        assert_eq!(summary.source, "repl@127.0.0.1:3306 (server_id 1001)");
        assert_eq!(summary.position_store, "store");
        assert_eq!(summary.channels, vec!["ops"]);
        assert_eq!(summary.api.as_deref(), Some("127.0.0.1:8080"));
        assert!(summary.rule_dir.is_none());
    }
}
