//! `binwatch rules` handler.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use binwatch_cdc_pipeline::RuleLoader;
use binwatch_core::config::BinwatchConfig;
use binwatch_core::rule::{AlertRule, RuleStatus};

use crate::cli::{RulesAction, RulesArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render, clip};

pub async fn execute(
    args: RulesArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        RulesAction::List { status } => execute_list(config_path, status, writer).await,
        RulesAction::Validate { path } => execute_validate(config_path, path, writer).await,
    }
}

async fn execute_list(
    config_path: &Path,
    status_filter: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let filter = status_filter
        .as_deref()
        .map(parse_status)
        .transpose()?;
    let config = BinwatchConfig::load(config_path).await?;
    let rules = effective_rules(&config).await?;

    let report = RuleListReport::new(rules, filter);
    writer.render(&report)?;
    Ok(())
}

/// Inline rules, then directory rules whose id is not already taken, in
/// the order the pipeline loads them.
pub async fn effective_rules(config: &BinwatchConfig) -> Result<Vec<RuleEntry>, CliError> {
    let mut entries: Vec<RuleEntry> = config
        .alerts
        .rules
        .iter()
        .map(|r| RuleEntry::new(r, "inline"))
        .collect();

    if config.alerts.rule_dir.is_empty() {
        return Ok(entries);
    }

    info!(dir = %config.alerts.rule_dir, "loading rule directory");
    for rule in RuleLoader::load_directory(&config.alerts.rule_dir).await? {
        if entries.iter().any(|e| e.id == rule.id) {
            debug!(rule_id = %rule.id, "shadowed by inline rule");
            continue;
        }
        entries.push(RuleEntry::new(&rule, &config.alerts.rule_dir));
    }
    Ok(entries)
}

/// Check every rule file in the directory individually, so one bad file
/// does not hide the others. Channel names are checked when the
/// configuration loads.
async fn execute_validate(
    config_path: &Path,
    path: Option<PathBuf>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await;
    let dir = match (path, &config) {
        (Some(path), _) => path,
        (None, Ok(config)) if !config.alerts.rule_dir.is_empty() => {
            PathBuf::from(&config.alerts.rule_dir)
        }
        (None, Ok(_)) => {
            return Err(CliError::Command(
                "alerts.rule_dir is not set; pass a directory".to_owned(),
            ));
        }
        (None, Err(e)) => return Err(CliError::Config(e.to_string())),
    };
    info!(path = %dir.display(), "validating rule files");

    let report = validate_directory(&dir, config.as_ref().ok()).await?;
    writer.render(&report)?;

    if report.invalid > 0 {
        return Err(CliError::Rule(format!("{} invalid rule file(s)", report.invalid)));
    }
    Ok(())
}

pub async fn validate_directory(
    dir: &Path,
    config: Option<&BinwatchConfig>,
) -> Result<RuleValidationReport, CliError> {
    let files = RuleLoader::rule_files(dir).await?;

    let channels: Option<HashSet<&str>> = config.map(|c| {
        c.notify
            .channels
            .iter()
            .map(|ch| ch.name.as_str())
            .collect()
    });

    let mut seen = HashSet::new();
    let mut valid = 0;
    let mut errors = Vec::new();
    for file in &files {
        let outcome = RuleLoader::load_file(file)
            .await
            .map_err(|e| e.to_string())
            .and_then(|rule| {
                if !seen.insert(rule.id.clone()) {
                    return Err(format!("duplicate rule id '{}'", rule.id));
                }
                match (config, &channels) {
                    (Some(config), Some(names)) => config
                        .check_rule_channels(&rule, names)
                        .map_err(|e| e.to_string()),
                    _ => Ok(()),
                }
            });
        match outcome {
            Ok(()) => valid += 1,
            Err(error) => errors.push(RuleError {
                file: file.display().to_string(),
                error,
            }),
        }
    }

    Ok(RuleValidationReport {
        path: dir.display().to_string(),
        total_files: files.len(),
        valid,
        invalid: errors.len(),
        errors,
    })
}

fn parse_status(s: &str) -> Result<RuleStatus, CliError> {
    match s.to_ascii_lowercase().as_str() {
        "enabled" => Ok(RuleStatus::Enabled),
        "disabled" => Ok(RuleStatus::Disabled),
        "test" => Ok(RuleStatus::Test),
        other => Err(CliError::Command(format!(
            "unknown rule status '{other}' (expected enabled, disabled or test)"
        ))),
    }
}

fn status_str(status: RuleStatus) -> &'static str {
    match status {
        RuleStatus::Enabled => "enabled",
        RuleStatus::Disabled => "disabled",
        RuleStatus::Test => "test",
    }
}

#[derive(Serialize)]
pub struct RuleListReport {
    pub total: usize,
    pub rules: Vec<RuleEntry>,
}

impl RuleListReport {
    fn new(rules: Vec<RuleEntry>, filter: Option<RuleStatus>) -> Self {
        let rules: Vec<_> = rules
            .into_iter()
            .filter(|r| filter.is_none_or(|f| r.status == status_str(f)))
            .collect();
        Self {
            total: rules.len(),
            rules,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RuleEntry {
    pub id: String,
    pub title: String,
    pub severity: String,
    pub status: String,
    /// `threshold/seconds by group_by`, or `per event`.
    pub trigger: String,
    pub channels: Vec<String>,
    pub tags: Vec<String>,
    /// `inline` or the rule directory.
    pub origin: String,
}

impl RuleEntry {
    fn new(rule: &AlertRule, origin: &str) -> Self {
        let trigger = match &rule.detection.window {
            Some(w) => format!("{}/{}s by {}", w.threshold, w.seconds, w.group_by),
            None => "per event".to_owned(),
        };
        Self {
            id: rule.id.clone(),
            title: rule.title.clone(),
            severity: rule.severity.as_str().to_owned(),
            status: status_str(rule.status).to_owned(),
            trigger,
            channels: rule.channels.clone(),
            tags: rule.tags.clone(),
            origin: origin.to_owned(),
        }
    }
}

impl Render for RuleListReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Alert Rules ({} total)", self.total.to_string().bold())?;
        writeln!(w)?;
        writeln!(
            w,
            "{:<24} {:<30} {:<9} {:<9} {:<22} Channels",
            "ID", "Title", "Severity", "Status", "Trigger"
        )?;
        writeln!(w, "{}", "-".repeat(110))?;

        for r in &self.rules {
            let status = match r.status.as_str() {
                "enabled" => r.status.green(),
                "disabled" => r.status.yellow(),
                _ => r.status.cyan(),
            };
            let channels = if r.channels.is_empty() {
                "(default)".to_owned()
            } else {
                r.channels.join(",")
            };
            writeln!(
                w,
                "{:<24} {:<30} {:<9} {:<9} {:<22} {}",
                clip(&r.id, 24),
                clip(&r.title, 30),
                r.severity,
                status,
                clip(&r.trigger, 22),
                channels
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
pub struct RuleValidationReport {
    pub path: String,
    pub total_files: usize,
    pub valid: usize,
    pub invalid: usize,
    pub errors: Vec<RuleError>,
}

#[derive(Serialize)]
pub struct RuleError {
    pub file: String,
    pub error: String,
}

impl Render for RuleValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Rule Validation: {}", self.path.bold())?;
        writeln!(
            w,
            "  Files: {} total, {} valid, {} invalid",
            self.total_files,
            self.valid.to_string().green(),
            if self.invalid > 0 {
                self.invalid.to_string().red()
            } else {
                self.invalid.to_string().normal()
            }
        )?;
        for err in &self.errors {
            writeln!(w, "  {} {}: {}", "x".red(), err.file, err.error)?;
        }
        Ok(())
    }
}
