//! Rule file loader.
//!
//! A rule directory holds one rule per `.yml`/`.yaml` file. Loading a
//! directory is lenient: a file that fails to parse or validate is logged
//! and skipped, and a repeated id keeps the first file in name order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use binwatch_core::rule::AlertRule;

use crate::error::CdcError;

/// Larger files are refused before reading.
const MAX_RULE_FILE_BYTES: u64 = 1024 * 1024;
const MAX_RULES: usize = 10_000;

fn load_error(path: &Path, reason: impl Into<String>) -> CdcError {
    CdcError::RuleLoad {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Loads [`AlertRule`]s from YAML.
pub struct RuleLoader;

impl RuleLoader {
    /// Rule files directly inside `dir`, sorted by name.
    pub async fn rule_files(dir: &Path) -> Result<Vec<PathBuf>, CdcError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| load_error(dir, format!("cannot read directory: {e}")))?;

        let mut files = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| load_error(dir, format!("cannot read directory entry: {e}")))?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yml" | "yaml")
            ) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Every loadable rule in `dir`, in file name order.
    ///
    /// Fails only if the directory itself is unreadable or holds more than
    /// `MAX_RULES` rules.
    pub async fn load_directory(dir: impl AsRef<Path>) -> Result<Vec<AlertRule>, CdcError> {
        let dir = dir.as_ref();
        let mut rules = Vec::new();
        let mut ids = HashSet::new();

        for path in Self::rule_files(dir).await? {
            let rule = match Self::load_file(&path).await {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping rule file");
                    continue;
                }
            };
            if !ids.insert(rule.id.clone()) {
                warn!(rule_id = %rule.id, path = %path.display(), "duplicate rule id, skipping");
                continue;
            }
            rules.push(rule);
            if rules.len() > MAX_RULES {
                return Err(load_error(dir, format!("more than {MAX_RULES} rules")));
            }
        }

        info!(dir = %dir.display(), count = rules.len(), "alert rules loaded");
        Ok(rules)
    }

    pub async fn load_file(path: impl AsRef<Path>) -> Result<AlertRule, CdcError> {
        let path = path.as_ref();
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| load_error(path, e.to_string()))?
            .len();
        if size > MAX_RULE_FILE_BYTES {
            return Err(load_error(
                path,
                format!("{size} bytes exceeds the {MAX_RULE_FILE_BYTES} byte limit"),
            ));
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_error(path, e.to_string()))?;
        Self::parse_yaml(&content, &path.display().to_string())
    }

    /// Parse one rule and run [`AlertRule::validate`] on it.
    pub fn parse_yaml(yaml: &str, source: &str) -> Result<AlertRule, CdcError> {
        let rule: AlertRule = serde_yaml::from_str(yaml).map_err(|e| CdcError::RuleLoad {
            path: source.to_owned(),
            reason: format!("invalid YAML: {e}"),
        })?;
        if let Err(e) = rule.validate() {
            return Err(CdcError::RuleValidation {
                rule_id: rule.id,
                reason: e.to_string(),
            });
        }
        Ok(rule)
    }
}
