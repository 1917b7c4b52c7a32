//! Condition evaluation with a regex cache.
//!
//! [`RuleMatcher`] evaluates a rule's conditions against a [`ChangeEvent`].
//! Regex patterns are compiled once, when the rule is added.

use std::collections::HashMap;

use binwatch_core::ddl::DdlKind;
use binwatch_core::rule::{AlertRule, ConditionModifier, FieldCondition};
use binwatch_core::types::{ChangeEvent, RowImage};
use regex::Regex;

use crate::error::CdcError;

/// Condition matcher with compiled regexes keyed by (rule id, condition index).
#[derive(Debug, Default)]
pub struct RuleMatcher {
    regex_cache: HashMap<(String, usize), Regex>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the rule's regex conditions.
    pub fn compile_rule(&mut self, rule: &AlertRule) -> Result<(), CdcError> {
        for (idx, condition) in rule.detection.conditions.iter().enumerate() {
            if condition.modifier == ConditionModifier::Regex {
                let regex = Regex::new(&condition.value).map_err(|e| CdcError::RuleValidation {
                    rule_id: rule.id.clone(),
                    reason: format!(
                        "invalid regex in condition[{idx}] for field '{}': {e}",
                        condition.field
                    ),
                })?;
                self.regex_cache.insert((rule.id.clone(), idx), regex);
            }
        }
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) {
        self.regex_cache.retain(|(id, _), _| id != rule_id);
    }

    /// Whether every condition of `rule` holds for `event`.
    ///
    /// A field the event does not carry never matches; `negate` inverts
    /// that too. No conditions means every event matches.
    pub fn matches(&self, rule: &AlertRule, event: &ChangeEvent) -> Result<bool, CdcError> {
        for (idx, condition) in rule.detection.conditions.iter().enumerate() {
            let values = field_values(event, &condition.field);
            let mut matched = false;
            for value in &values {
                if self.evaluate_condition(condition, value, &rule.id, idx)? {
                    matched = true;
                    break;
                }
            }
            if matched == condition.negate {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn evaluate_condition(
        &self,
        condition: &FieldCondition,
        field_value: &str,
        rule_id: &str,
        condition_idx: usize,
    ) -> Result<bool, CdcError> {
        let value = field_value.to_lowercase();
        let expected = condition.value.to_lowercase();
        match condition.modifier {
            ConditionModifier::Exact => Ok(value == expected),
            ConditionModifier::Contains => Ok(value.contains(&expected)),
            ConditionModifier::StartsWith => Ok(value.starts_with(&expected)),
            ConditionModifier::EndsWith => Ok(value.ends_with(&expected)),
            ConditionModifier::In => Ok(expected.split(',').any(|item| item.trim() == value)),
            ConditionModifier::Regex => {
                let regex = self
                    .regex_cache
                    .get(&(rule_id.to_owned(), condition_idx))
                    .ok_or_else(|| {
                        CdcError::RuleMatch(format!(
                            "regex not compiled for rule '{rule_id}' condition[{condition_idx}]"
                        ))
                    })?;
                Ok(regex.is_match(field_value))
            }
        }
    }
}

/// Values of `field` on `event`; empty when the event does not carry it.
///
/// `changed` yields every changed column. Image columns holding SQL `NULL`
/// count as absent.
pub fn field_values(event: &ChangeEvent, field: &str) -> Vec<String> {
    match field {
        "database" => vec![event.database.clone()],
        "table" => vec![event.table.clone()],
        "qualified_table" => vec![event.qualified_table()],
        "operation" => vec![event.operation.as_str().to_owned()],
        "user" => event.user.iter().cloned().collect(),
        "statement" => event.ddl.iter().map(|d| d.statement.clone()).collect(),
        "ddl_kind" => event
            .ddl
            .iter()
            .filter_map(|d| d.kind)
            .map(|k| ddl_kind_name(k).to_owned())
            .collect(),
        "changed" => event.changes.keys().cloned().collect(),
        _ => {
            if let Some(column) = field.strip_prefix("before.") {
                image_value(event.before.as_ref(), column)
            } else if let Some(column) = field.strip_prefix("after.") {
                image_value(event.after.as_ref(), column)
            } else {
                Vec::new()
            }
        }
    }
}

/// Single value used to group windowed rules. `None` when absent.
pub fn group_key(event: &ChangeEvent, field: &str) -> Option<String> {
    let values = field_values(event, field);
    (!values.is_empty()).then(|| values.join(","))
}

fn image_value(image: Option<&RowImage>, column: &str) -> Vec<String> {
    match image.and_then(|i| i.get(column)) {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(other) => vec![other.to_string()],
    }
}

fn ddl_kind_name(kind: DdlKind) -> &'static str {
    match kind {
        DdlKind::Create => "create",
        DdlKind::Alter => "alter",
        DdlKind::Drop => "drop",
        DdlKind::Rename => "rename",
        DdlKind::Truncate => "truncate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::rule::{Detection, RuleStatus};
    use binwatch_core::types::{Operation, RawMutation, Severity, StreamPosition};
    use chrono::Utc;
    use serde_json::json;

    fn update_event() -> ChangeEvent {
        let mutation = RawMutation {
            operation: Operation::Update,
            database: "shop".to_owned(),
            table: "users".to_owned(),
            before: Some(
                [
                    ("id".to_owned(), json!(7)),
                    ("email".to_owned(), json!("old@example.com")),
                    ("deleted_at".to_owned(), serde_json::Value::Null),
                ]
                .into_iter()
                .collect(),
            ),
            after: Some(
                [
                    ("id".to_owned(), json!(7)),
                    ("email".to_owned(), json!("new@example.com")),
                    ("deleted_at".to_owned(), serde_json::Value::Null),
                ]
                .into_iter()
                .collect(),
            ),
            position: StreamPosition::new("mysql-bin.000003", 1200),
            txn_id: "mysql-bin.000003:1000".to_owned(),
            timestamp: Utc::now(),
            user: Some("app@10.0.0.8".to_owned()),
            ddl: None,
        };
        ChangeEvent::committed(mutation, 0, &["id".to_owned()])
    }

    fn condition(field: &str, modifier: ConditionModifier, value: &str) -> FieldCondition {
        FieldCondition {
            field: field.to_owned(),
            modifier,
            value: value.to_owned(),
            negate: false,
        }
    }

    fn make_rule(conditions: Vec<FieldCondition>) -> AlertRule {
        AlertRule {
            id: "test_rule".to_owned(),
            title: "Test".to_owned(),
            description: String::new(),
            severity: Severity::Medium,
            status: RuleStatus::Enabled,
            detection: Detection {
                conditions,
                window: None,
            },
            channels: vec![],
            tags: vec![],
        }
    }

    fn check(conditions: Vec<FieldCondition>) -> bool {
        let rule = make_rule(conditions);
        let mut matcher = RuleMatcher::new();
        matcher.compile_rule(&rule).unwrap();
        matcher.matches(&rule, &update_event()).unwrap()
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(check(vec![condition("qualified_table", ConditionModifier::Exact, "SHOP.users")]));
        assert!(check(vec![condition("operation", ConditionModifier::Exact, "update")]));
        assert!(!check(vec![condition("table", ConditionModifier::Exact, "orders")]));
    }

    #[test]
    fn string_modifiers() {
        assert!(check(vec![condition("user", ConditionModifier::StartsWith, "app@")]));
        assert!(check(vec![condition("after.email", ConditionModifier::EndsWith, "@EXAMPLE.com")]));
        assert!(check(vec![condition("before.email", ConditionModifier::Contains, "old")]));
        assert!(check(vec![condition("operation", ConditionModifier::In, "insert, update")]));
        assert!(!check(vec![condition("operation", ConditionModifier::In, "insert,delete")]));
    }

    #[test]
    fn numeric_image_values_compare_as_text() {
        assert!(check(vec![condition("after.id", ConditionModifier::Exact, "7")]));
    }

    #[test]
    fn regex_is_case_sensitive() {
        assert!(check(vec![condition("after.email", ConditionModifier::Regex, r"^new@.*\.com$")]));
        assert!(!check(vec![condition("after.email", ConditionModifier::Regex, "^NEW@")]));
    }

    #[test]
    fn changed_matches_any_changed_column() {
        assert!(check(vec![condition("changed", ConditionModifier::Exact, "email")]));
        assert!(!check(vec![condition("changed", ConditionModifier::Exact, "id")]));
    }

    #[test]
    fn missing_field_never_matches_and_negate_inverts() {
        assert!(!check(vec![condition("statement", ConditionModifier::Contains, "")]));
        assert!(!check(vec![condition("after.deleted_at", ConditionModifier::Exact, "null")]));
        let mut negated = condition("after.deleted_at", ConditionModifier::Exact, "x");
        negated.negate = true;
        assert!(check(vec![negated]));
    }

    #[test]
    fn all_conditions_are_anded() {
        let mut not_orders = condition("table", ConditionModifier::Exact, "orders");
        not_orders.negate = true;
        assert!(check(vec![
            condition("database", ConditionModifier::Exact, "shop"),
            not_orders,
        ]));
        assert!(!check(vec![
            condition("database", ConditionModifier::Exact, "shop"),
            condition("operation", ConditionModifier::Exact, "DELETE"),
        ]));
    }

    #[test]
    fn empty_conditions_match_everything() {
        assert!(check(vec![]));
    }

    #[test]
    fn uncompiled_regex_is_an_error() {
        let rule = make_rule(vec![condition("table", ConditionModifier::Regex, "u.*")]);
        let matcher = RuleMatcher::new();
        assert!(matcher.matches(&rule, &update_event()).is_err());
    }

    #[test]
    fn remove_rule_clears_cache() {
        let rule = make_rule(vec![condition("table", ConditionModifier::Regex, "u.*")]);
        let mut matcher = RuleMatcher::new();
        matcher.compile_rule(&rule).unwrap();
        matcher.remove_rule("test_rule");
        assert!(matcher.matches(&rule, &update_event()).is_err());
    }

    #[test]
    fn group_key_joins_changed_columns() {
        let event = update_event();
        assert_eq!(group_key(&event, "qualified_table").as_deref(), Some("shop.users"));
        assert_eq!(group_key(&event, "changed").as_deref(), Some("email"));
        assert_eq!(group_key(&event, "statement"), None);
    }
}
