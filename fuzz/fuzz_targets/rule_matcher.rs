#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use binwatch_cdc_pipeline::RuleMatcher;
use binwatch_core::rule::{AlertRule, ConditionModifier, Detection, FieldCondition, RuleStatus};
use binwatch_core::types::{ChangeEvent, Operation, RawMutation, Severity, StreamPosition};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    conditions: Vec<FuzzCondition>,
    table: String,
    column: String,
    before: String,
    after: String,
}

#[derive(Arbitrary, Debug)]
struct FuzzCondition {
    field: FuzzField,
    modifier: FuzzModifier,
    value: String,
    negate: bool,
}

#[derive(Arbitrary, Debug)]
enum FuzzField {
    Table,
    QualifiedTable,
    Operation,
    Changed,
    Before,
    After,
}

#[derive(Arbitrary, Debug)]
enum FuzzModifier {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
}

impl FuzzCondition {
    fn field(&self, column: &str) -> String {
        match self.field {
            FuzzField::Table => "table".to_owned(),
            FuzzField::QualifiedTable => "qualified_table".to_owned(),
            FuzzField::Operation => "operation".to_owned(),
            FuzzField::Changed => "changed".to_owned(),
            FuzzField::Before => format!("before.{column}"),
            FuzzField::After => format!("after.{column}"),
        }
    }

    fn modifier(&self) -> ConditionModifier {
        match self.modifier {
            FuzzModifier::Exact => ConditionModifier::Exact,
            FuzzModifier::Contains => ConditionModifier::Contains,
            FuzzModifier::StartsWith => ConditionModifier::StartsWith,
            FuzzModifier::EndsWith => ConditionModifier::EndsWith,
            FuzzModifier::Regex => ConditionModifier::Regex,
            FuzzModifier::In => ConditionModifier::In,
        }
    }
}

fuzz_target!(|input: FuzzInput| {
    let column = if input.column.is_empty() { "c" } else { input.column.as_str() };
    let conditions: Vec<FieldCondition> = input
        .conditions
        .iter()
        .take(8)
        .map(|c| FieldCondition {
            field: c.field(column),
            modifier: c.modifier(),
            value: c.value.clone(),
            negate: c.negate,
        })
        .collect();
    if conditions.is_empty() {
        return;
    }

    let rule = AlertRule {
        id: "fuzz_rule".to_owned(),
        title: "Fuzz Rule".to_owned(),
        description: String::new(),
        severity: Severity::Info,
        status: RuleStatus::Enabled,
        detection: Detection {
            conditions,
            window: None,
        },
        channels: Vec::new(),
        tags: Vec::new(),
    };

    let mut matcher = RuleMatcher::new();
    if matcher.compile_rule(&rule).is_err() {
        return;
    }

    let image = |v: &str| {
        [(column.to_owned(), serde_json::Value::String(v.to_owned()))]
            .into_iter()
            .collect()
    };
    let event = ChangeEvent::committed(
        RawMutation {
            operation: Operation::Update,
            database: "fuzz".to_owned(),
            table: input.table,
            before: Some(image(&input.before)),
            after: Some(image(&input.after)),
            position: StreamPosition::new("mysql-bin.000001", 4),
            txn_id: "mysql-bin.000001:4".to_owned(),
            timestamp: chrono::Utc::now(),
            user: None,
            ddl: None,
        },
        0,
        &[column.to_owned()],
    );

    let _ = matcher.matches(&rule, &event);
});
