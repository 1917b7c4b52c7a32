//! Alert rule definitions.
//!
//! Rules are plain configuration: they live in YAML files under
//! `alerts.rule_dir` or inline in `binwatch.toml` as `[[alerts.rules]]`.
//! Evaluation state (windows, cooldowns) belongs to the rule engine.
//!
//! ```yaml
//! id: orders_bulk_insert
//! title: Bulk insert on orders
//! severity: high
//! detection:
//!   conditions:
//!     - field: qualified_table
//!       value: shop.orders
//!     - field: operation
//!       value: INSERT
//!   window:
//!     group_by: qualified_table
//!     threshold: 1000
//!     seconds: 60
//!     cooldown_secs: 300
//! channels: [ops-webhook]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Severity;

/// Maximum rule id length.
pub const MAX_RULE_ID_LEN: usize = 256;

/// Event fields a condition or `group_by` may reference, besides
/// `before.<column>` and `after.<column>`.
pub const RULE_FIELDS: &[&str] = &[
    "database",
    "table",
    "qualified_table",
    "operation",
    "user",
    "statement",
    "ddl_kind",
    "changed",
];

/// One alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub status: RuleStatus,
    pub detection: Detection,
    /// Channel names; empty means `notify.default_channels`.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Rule status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Enabled,
    Disabled,
    /// Evaluated and logged, never alerts.
    Test,
}

/// Conditions (AND-ed) plus an optional window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Detection {
    #[serde(default)]
    pub conditions: Vec<FieldCondition>,
    #[serde(default)]
    pub window: Option<WindowSpec>,
}

/// Predicate over one event field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldCondition {
    pub field: String,
    #[serde(default)]
    pub modifier: ConditionModifier,
    /// For `in`, a comma-separated list.
    pub value: String,
    /// Invert the result.
    #[serde(default)]
    pub negate: bool,
}

/// How a condition compares the field to its value.
///
/// All comparisons except `regex` are case-insensitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionModifier {
    #[default]
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
}

/// Trailing-window aggregate: fire when more than `threshold` matching rows
/// share a `group_by` value within `seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowSpec {
    #[serde(default = "default_group_by")]
    pub group_by: String,
    pub threshold: u64,
    pub seconds: u64,
    /// Minimum time between two alerts for the same key.
    #[serde(default)]
    pub cooldown_secs: u64,
}

fn default_group_by() -> String {
    "qualified_table".to_owned()
}

impl AlertRule {
    pub fn is_windowed(&self) -> bool {
        self.detection.window.is_some()
    }

    /// Structural validation. Regex conditions are compiled here so broken
    /// patterns fail at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            field: format!("alerts.rules[{}]", self.id),
            reason,
        };

        if self.id.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "alerts.rules".to_owned(),
                reason: "rule id must not be empty".to_owned(),
            });
        }
        if self.id.len() > MAX_RULE_ID_LEN {
            return Err(invalid(format!(
                "rule id must not exceed {MAX_RULE_ID_LEN} characters"
            )));
        }
        if self.title.is_empty() {
            return Err(invalid("rule title must not be empty".to_owned()));
        }

        for condition in &self.detection.conditions {
            if !is_valid_field(&condition.field) {
                return Err(invalid(format!("unknown field '{}'", condition.field)));
            }
            if condition.modifier == ConditionModifier::Regex {
                regex::Regex::new(&condition.value)
                    .map_err(|e| invalid(format!("invalid regex '{}': {e}", condition.value)))?;
            }
        }

        match &self.detection.window {
            Some(window) => {
                if window.threshold == 0 {
                    return Err(invalid("window threshold must be greater than 0".to_owned()));
                }
                if window.seconds == 0 {
                    return Err(invalid("window seconds must be greater than 0".to_owned()));
                }
                if !is_valid_field(&window.group_by) {
                    return Err(invalid(format!(
                        "unknown group_by field '{}'",
                        window.group_by
                    )));
                }
            }
            None => {
                if self.detection.conditions.is_empty() {
                    return Err(invalid(
                        "a rule without a window needs at least one condition".to_owned(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Whether `field` names something the rule engine can resolve.
pub fn is_valid_field(field: &str) -> bool {
    if RULE_FIELDS.contains(&field) {
        return true;
    }
    ["before.", "after."]
        .iter()
        .any(|prefix| field.strip_prefix(prefix).is_some_and(|col| !col.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete_rule() -> AlertRule {
        AlertRule {
            id: "delete_on_payments".to_owned(),
            title: "Delete on payments".to_owned(),
            description: String::new(),
            severity: Severity::High,
            status: RuleStatus::Enabled,
            detection: Detection {
                conditions: vec![
                    FieldCondition {
                        field: "qualified_table".to_owned(),
                        modifier: ConditionModifier::Exact,
                        value: "shop.payments".to_owned(),
                        negate: false,
                    },
                    FieldCondition {
                        field: "operation".to_owned(),
                        modifier: ConditionModifier::Exact,
                        value: "DELETE".to_owned(),
                        negate: false,
                    },
                ],
                window: None,
            },
            channels: vec![],
            tags: vec![],
        }
    }

    #[test]
    fn valid_rule_passes() {
        delete_rule().validate().unwrap();
    }

    #[test]
    fn stateless_rule_without_conditions_fails() {
        let mut rule = delete_rule();
        rule.detection.conditions.clear();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn windowed_rule_without_conditions_is_fine() {
        let mut rule = delete_rule();
        rule.detection.conditions.clear();
        rule.detection.window = Some(WindowSpec {
            group_by: "qualified_table".to_owned(),
            threshold: 1000,
            seconds: 60,
            cooldown_secs: 300,
        });
        rule.validate().unwrap();
        assert!(rule.is_windowed());
    }

    #[test]
    fn zero_window_values_fail() {
        let mut rule = delete_rule();
        rule.detection.window = Some(WindowSpec {
            group_by: "table".to_owned(),
            threshold: 0,
            seconds: 60,
            cooldown_secs: 0,
        });
        assert!(rule.validate().unwrap_err().to_string().contains("threshold"));
    }

    #[test]
    fn bad_regex_fails_validation() {
        let mut rule = delete_rule();
        rule.detection.conditions[0].modifier = ConditionModifier::Regex;
        rule.detection.conditions[0].value = "([unclosed".to_owned();
        assert!(rule.validate().unwrap_err().to_string().contains("invalid regex"));
    }

    #[test]
    fn unknown_field_fails_validation() {
        let mut rule = delete_rule();
        rule.detection.conditions[0].field = "hostname".to_owned();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn image_fields_are_valid() {
        assert!(is_valid_field("before.email"));
        assert!(is_valid_field("after.status"));
        assert!(!is_valid_field("after."));
        assert!(!is_valid_field("during.x"));
    }

    #[test]
    fn rule_from_yaml() {
        let yaml = r#"
id: orders_bulk_insert
title: Bulk insert on orders
severity: high
detection:
  conditions:
    - field: table
      value: orders
    - field: operation
      modifier: in
      value: INSERT,UPDATE
  window:
    threshold: 1000
    seconds: 60
    cooldown_secs: 300
channels: [ops-webhook]
"#;
        let rule: AlertRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.severity, Severity::High);
        assert_eq!(rule.detection.conditions[1].modifier, ConditionModifier::In);
        let window = rule.detection.window.unwrap();
        assert_eq!(window.group_by, "qualified_table");
        assert_eq!(window.cooldown_secs, 300);
    }

    #[test]
    fn unknown_rule_keys_are_rejected() {
        let toml = r#"
id = "x"
title = "X"
severity = "low"
priority = 3
[detection]
conditions = [{ field = "table", value = "t" }]
"#;
        assert!(toml::from_str::<AlertRule>(toml).is_err());
    }
}
