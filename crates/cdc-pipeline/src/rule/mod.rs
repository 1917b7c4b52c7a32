//! Rule engine: evaluates committed change events against alert rules.
//!
//! - [`RuleEngine`]: rule set, window state and alert construction
//! - [`loader`]: YAML rule files
//! - [`matcher`]: condition evaluation
//! - [`window`]: per-second event-time windows
//!
//! Stateless rules alert on every matching event; the dispatcher handles
//! suppression. Windowed rules count matching events per group key and
//! alert when the count exceeds the threshold, at most once per cooldown.
//! Window state is a cache: after a restart it is rebuilt by replaying
//! recently stored events and seeding cooldowns from stored alerts.

pub mod loader;
pub mod matcher;
pub mod window;

pub use loader::RuleLoader;
pub use matcher::RuleMatcher;
pub use window::{SlidingWindow, WindowOutcome};

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use binwatch_core::metrics as m;
use binwatch_core::rule::{AlertRule, RuleStatus, WindowSpec};
use binwatch_core::types::{Alert, ChangeEvent, DeliveryStatus, WindowSummary};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::error::CdcError;

/// Alert rule coordinator.
///
/// ```ignore
/// let mut engine = RuleEngine::new().with_default_channels(vec!["ops".into()]);
/// engine.load_rules_from_dir("/etc/binwatch/rules").await?;
/// for alert in engine.evaluate(&event)? {
///     store.append_alert(&alert)?;
/// }
/// ```
#[derive(Debug)]
pub struct RuleEngine {
    /// Rules by id; evaluation follows id order.
    rules: BTreeMap<String, AlertRule>,
    matcher: RuleMatcher,
    /// (rule_id, group key) -> window
    windows: HashMap<(String, String), SlidingWindow>,
    max_window_keys: usize,
    default_channels: Vec<String>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
            matcher: RuleMatcher::new(),
            windows: HashMap::new(),
            max_window_keys: 100_000,
            default_channels: Vec::new(),
        }
    }

    /// Upper bound on tracked windows.
    pub fn with_max_window_keys(mut self, max: usize) -> Self {
        self.max_window_keys = max;
        self
    }

    /// Channels for rules that name none.
    pub fn with_default_channels(mut self, channels: Vec<String>) -> Self {
        self.default_channels = channels;
        self
    }

    /// Load every rule file in `dir`.
    pub async fn load_rules_from_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, CdcError> {
        let rules = RuleLoader::load_directory(dir).await?;
        let count = rules.len();
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(count)
    }

    /// Add or replace a rule.
    pub fn add_rule(&mut self, rule: AlertRule) -> Result<(), CdcError> {
        rule.validate().map_err(|e| CdcError::RuleValidation {
            rule_id: rule.id.clone(),
            reason: e.to_string(),
        })?;
        self.matcher.remove_rule(&rule.id);
        self.matcher.compile_rule(&rule)?;
        self.windows.retain(|(id, _), _| id != &rule.id);
        if self.rules.insert(rule.id.clone(), rule).is_some() {
            debug!("replaced existing rule");
        }
        gauge!(m::RULES_LOADED).set(self.rules.len() as f64);
        Ok(())
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<AlertRule> {
        self.matcher.remove_rule(rule_id);
        self.windows.retain(|(id, _), _| id != rule_id);
        let removed = self.rules.remove(rule_id);
        gauge!(m::RULES_LOADED).set(self.rules.len() as f64);
        removed
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.values()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Longest window among active windowed rules, in seconds.
    pub fn max_window_secs(&self) -> u64 {
        self.windows_specs().map(|w| w.seconds).max().unwrap_or(0)
    }

    /// Longest cooldown among active windowed rules, in seconds.
    pub fn max_cooldown_secs(&self) -> u64 {
        self.windows_specs().map(|w| w.cooldown_secs).max().unwrap_or(0)
    }

    fn windows_specs(&self) -> impl Iterator<Item = &WindowSpec> {
        self.rules
            .values()
            .filter(|r| r.status != RuleStatus::Disabled)
            .filter_map(|r| r.detection.window.as_ref())
    }

    /// Evaluate `event` against every active rule. Every rule that fires
    /// yields its own alert.
    pub fn evaluate(&mut self, event: &ChangeEvent) -> Result<Vec<Alert>, CdcError> {
        self.run(event, true)
    }

    /// Feed an already-processed event into window state without alerting.
    pub fn replay(&mut self, event: &ChangeEvent) -> Result<(), CdcError> {
        self.run(event, false).map(|_| ())
    }

    /// Restore the cooldown recorded by a stored windowed alert.
    pub fn seed_cooldown(&mut self, alert: &Alert) {
        let Some(summary) = &alert.window else {
            return;
        };
        if !self.rules.contains_key(&alert.rule_id) {
            return;
        }
        self.windows
            .entry((alert.rule_id.clone(), summary.group_key.clone()))
            .or_default()
            .seed_fired(summary.last_seen);
    }

    fn run(&mut self, event: &ChangeEvent, emit: bool) -> Result<Vec<Alert>, CdcError> {
        let mut alerts = Vec::new();

        for rule in self.rules.values() {
            if rule.status == RuleStatus::Disabled {
                continue;
            }
            if !self.matcher.matches(rule, event)? {
                continue;
            }

            let alert = match &rule.detection.window {
                None => {
                    let key = event.qualified_table();
                    let summary = stateless_summary(event);
                    Some(self.build_alert(rule, key, summary, Some(event), None))
                }
                Some(spec) => {
                    let Some(group_key) = matcher::group_key(event, &spec.group_by) else {
                        continue;
                    };
                    let window = self
                        .windows
                        .entry((rule.id.clone(), group_key.clone()))
                        .or_default();
                    match window.record(event.timestamp, spec) {
                        WindowOutcome::Fired { count, first_seen } => {
                            let summary = WindowSummary {
                                group_key: group_key.clone(),
                                count,
                                window_secs: spec.seconds,
                                first_seen,
                                last_seen: event.timestamp,
                            };
                            let text = format!(
                                "{count} matching changes for {}={group_key} within {}s (threshold {})",
                                spec.group_by, spec.seconds, spec.threshold
                            );
                            Some(self.build_alert(rule, group_key, text, Some(event), Some(summary)))
                        }
                        WindowOutcome::Below(_) | WindowOutcome::Cooling(_) => None,
                    }
                }
            };

            let Some(alert) = alert else {
                continue;
            };
            if !emit {
                continue;
            }
            if rule.status == RuleStatus::Test {
                info!(
                    rule_id = %rule.id,
                    key = %alert.key,
                    summary = %alert.summary,
                    "test rule matched, not alerting"
                );
                continue;
            }
            counter!(m::RULES_ALERTS_TOTAL, m::LABEL_SEVERITY => rule.severity.as_str())
                .increment(1);
            alerts.push(alert);
        }

        self.enforce_window_limits(event.timestamp);
        Ok(alerts)
    }

    fn build_alert(
        &self,
        rule: &AlertRule,
        key: String,
        summary: String,
        event: Option<&ChangeEvent>,
        window: Option<WindowSummary>,
    ) -> Alert {
        let channels = if rule.channels.is_empty() {
            self.default_channels.clone()
        } else {
            rule.channels.clone()
        };
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_title: rule.title.clone(),
            severity: rule.severity,
            key,
            summary,
            event: event.cloned(),
            window,
            channels,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Pending,
        }
    }

    /// Bound window memory: drop idle windows, then everything if still
    /// over the limit.
    fn enforce_window_limits(&mut self, now: DateTime<Utc>) {
        if self.windows.len() > self.max_window_keys {
            let rules = &self.rules;
            self.windows.retain(|(rule_id, _), window| {
                rules
                    .get(rule_id)
                    .and_then(|r| r.detection.window.as_ref())
                    .is_some_and(|spec| !window.is_idle(now, spec))
            });

            if self.windows.len() > self.max_window_keys {
                warn!(
                    count = self.windows.len(),
                    max = self.max_window_keys,
                    "window limit exceeded after cleanup, clearing all"
                );
                self.windows.clear();
            }
        }
        gauge!(m::RULES_WINDOW_KEYS).set(self.windows.len() as f64);
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn stateless_summary(event: &ChangeEvent) -> String {
    let mut text = format!("{} on {}", event.operation, event.qualified_table());
    if !event.primary_key.is_empty() {
        let key: Vec<String> = event
            .primary_key
            .iter()
            .map(|(column, value)| format!("{column}={value}"))
            .collect();
        text.push_str(&format!(" ({})", key.join(", ")));
    }
    if let Some(user) = &event.user {
        text.push_str(&format!(" by {user}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::rule::{ConditionModifier, Detection, FieldCondition};
    use binwatch_core::types::{Operation, RawMutation, Severity, StreamPosition};
    use chrono::Duration;
    use serde_json::json;

    fn event(table: &str, op: Operation, id: i64, at: DateTime<Utc>) -> ChangeEvent {
        let image = Some([("id".to_owned(), json!(id))].into_iter().collect());
        let (before, after) = match op {
            Operation::Delete => (image, None),
            _ => (None, image),
        };
        ChangeEvent::committed(
            RawMutation {
                operation: op,
                database: "shop".to_owned(),
                table: table.to_owned(),
                before,
                after,
                position: StreamPosition::new("mysql-bin.000001", 1000 + id as u64),
                txn_id: format!("t{id}"),
                timestamp: at,
                user: Some("app@10.0.0.8".to_owned()),
                ddl: None,
            },
            0,
            &["id".to_owned()],
        )
    }

    fn condition(field: &str, value: &str) -> FieldCondition {
        FieldCondition {
            field: field.to_owned(),
            modifier: ConditionModifier::Exact,
            value: value.to_owned(),
            negate: false,
        }
    }

    fn rule(id: &str, conditions: Vec<FieldCondition>, window: Option<WindowSpec>) -> AlertRule {
        AlertRule {
            id: id.to_owned(),
            title: format!("rule {id}"),
            description: String::new(),
            severity: Severity::High,
            status: RuleStatus::Enabled,
            detection: Detection { conditions, window },
            channels: vec![],
            tags: vec![],
        }
    }

    fn bulk_rule() -> AlertRule {
        rule(
            "orders_bulk_insert",
            vec![
                condition("qualified_table", "shop.orders"),
                condition("operation", "INSERT"),
            ],
            Some(WindowSpec {
                group_by: "qualified_table".to_owned(),
                threshold: 1000,
                seconds: 60,
                cooldown_secs: 300,
            }),
        )
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn engine_starts_empty() {
        let engine = RuleEngine::new();
        assert_eq!(engine.rule_count(), 0);
        assert_eq!(engine.max_window_secs(), 0);
    }

    #[test]
    fn add_and_remove_rule() {
        let mut engine = RuleEngine::new();
        engine.add_rule(bulk_rule()).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.max_window_secs(), 60);
        assert_eq!(engine.max_cooldown_secs(), 300);
        assert!(engine.remove_rule("orders_bulk_insert").is_some());
        assert_eq!(engine.rule_count(), 0);
    }

    #[test]
    fn invalid_rule_is_rejected() {
        let mut engine = RuleEngine::new();
        let err = engine.add_rule(rule("empty", vec![], None)).unwrap_err();
        assert!(matches!(err, CdcError::RuleValidation { .. }));
    }

    #[test]
    fn stateless_rule_alerts_per_event() {
        let mut engine = RuleEngine::new().with_default_channels(vec!["ops".to_owned()]);
        engine
            .add_rule(rule(
                "payments_delete",
                vec![
                    condition("table", "payments"),
                    condition("operation", "DELETE"),
                ],
                None,
            ))
            .unwrap();

        let alerts = engine
            .evaluate(&event("payments", Operation::Delete, 9, t0()))
            .unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.key, "shop.payments");
        assert_eq!(alert.channels, vec!["ops".to_owned()]);
        assert_eq!(alert.delivery_status, DeliveryStatus::Pending);
        assert!(alert.summary.contains("DELETE on shop.payments (id=9) by app@10.0.0.8"));
        assert!(alert.event.is_some());

        assert!(
            engine
                .evaluate(&event("payments", Operation::Insert, 10, t0()))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn bulk_insert_fires_exactly_once() {
        let mut engine = RuleEngine::new();
        engine.add_rule(bulk_rule()).unwrap();

        let mut alerts = Vec::new();
        for i in 0..1050 {
            let at = t0() + Duration::milliseconds(i * 50);
            alerts.extend(engine.evaluate(&event("orders", Operation::Insert, i, at)).unwrap());
        }
        assert_eq!(alerts.len(), 1);
        let summary = alerts[0].window.as_ref().unwrap();
        assert_eq!(summary.count, 1001);
        assert_eq!(summary.group_key, "shop.orders");
        assert_eq!(alerts[0].key, "shop.orders");

        // a second burst inside the cooldown stays quiet
        let burst = t0() + Duration::seconds(120);
        for i in 0..1100 {
            let at = burst + Duration::milliseconds(i * 20);
            assert!(
                engine
                    .evaluate(&event("orders", Operation::Insert, 5000 + i, at))
                    .unwrap()
                    .is_empty()
            );
        }
    }

    #[test]
    fn all_firing_rules_emit_independently() {
        let mut engine = RuleEngine::new();
        engine
            .add_rule(rule("a_any_delete", vec![condition("operation", "DELETE")], None))
            .unwrap();
        engine
            .add_rule(rule("b_payments", vec![condition("table", "payments")], None))
            .unwrap();
        let alerts = engine
            .evaluate(&event("payments", Operation::Delete, 1, t0()))
            .unwrap();
        let ids: Vec<_> = alerts.iter().map(|a| a.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["a_any_delete", "b_payments"]);
    }

    #[test]
    fn test_and_disabled_rules_do_not_alert() {
        let mut engine = RuleEngine::new();
        let mut test_rule = rule("t", vec![condition("table", "orders")], None);
        test_rule.status = RuleStatus::Test;
        let mut disabled = rule("d", vec![condition("table", "orders")], None);
        disabled.status = RuleStatus::Disabled;
        engine.add_rule(test_rule).unwrap();
        engine.add_rule(disabled).unwrap();
        assert!(
            engine
                .evaluate(&event("orders", Operation::Insert, 1, t0()))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn replay_rebuilds_windows_without_alerting() {
        let mut engine = RuleEngine::new();
        engine.add_rule(bulk_rule()).unwrap();
        for i in 0..990 {
            engine
                .replay(&event("orders", Operation::Insert, i, t0()))
                .unwrap();
        }
        assert_eq!(engine.window_count(), 1);

        let mut alerts = Vec::new();
        for i in 0..20 {
            alerts.extend(
                engine
                    .evaluate(&event("orders", Operation::Insert, 2000 + i, t0() + Duration::seconds(1)))
                    .unwrap(),
            );
        }
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn seeded_cooldown_survives_restart() {
        let mut engine = RuleEngine::new();
        engine.add_rule(bulk_rule()).unwrap();
        let stored = Alert {
            id: "a1".to_owned(),
            rule_id: "orders_bulk_insert".to_owned(),
            rule_title: "Bulk insert on orders".to_owned(),
            severity: Severity::High,
            key: "shop.orders".to_owned(),
            summary: String::new(),
            event: None,
            window: Some(WindowSummary {
                group_key: "shop.orders".to_owned(),
                count: 1001,
                window_secs: 60,
                first_seen: t0(),
                last_seen: t0(),
            }),
            channels: vec![],
            created_at: t0(),
            delivery_status: DeliveryStatus::Delivered,
        };
        engine.seed_cooldown(&stored);

        let later = t0() + Duration::seconds(60);
        for i in 0..1500 {
            assert!(
                engine
                    .evaluate(&event("orders", Operation::Insert, i, later))
                    .unwrap()
                    .is_empty()
            );
        }
    }

    #[test]
    fn window_limit_clears_when_nothing_is_idle() {
        let mut engine = RuleEngine::new().with_max_window_keys(2);
        let mut per_row = bulk_rule();
        per_row.detection.conditions = vec![condition("operation", "INSERT")];
        if let Some(w) = per_row.detection.window.as_mut() {
            w.group_by = "after.id".to_owned();
        }
        engine.add_rule(per_row).unwrap();
        for i in 0..3 {
            engine
                .evaluate(&event("orders", Operation::Insert, i, t0()))
                .unwrap();
        }
        assert_eq!(engine.window_count(), 0);
    }
}
