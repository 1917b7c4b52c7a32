//! Scope filter: decides which mutations reach the store and the rules.
//!
//! Exclusions are checked first and always win. Otherwise the most specific
//! matching inclusion decides, by its operation set and user list; ties go
//! to the pattern with more literal characters, then to the one declared
//! first. With no inclusions configured everything not excluded is in
//! scope.
//!
//! Admitted mutations carry their scope's settings (key columns, tracked
//! columns, masked columns). Projection onto tracked columns happens here;
//! masking happens when the event is built so the UPDATE diff still sees
//! the clear values.

use std::sync::Arc;

use binwatch_core::config::{ScopeConfig, UnparseableDdlPolicy, compile_glob};
use binwatch_core::metrics as m;
use binwatch_core::types::{ChangeEvent, Operation, RawMutation, RowImage};
use globset::GlobMatcher;
use metrics::counter;
use tracing::{debug, warn};

use crate::error::CdcError;
use crate::mask;

/// Per-scope settings applied to admitted mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSettings {
    pub primary_key: Vec<String>,
    /// Empty keeps every column.
    pub track_columns: Vec<String>,
    pub sensitive_columns: Vec<String>,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            primary_key: vec!["id".to_owned()],
            track_columns: Vec::new(),
            sensitive_columns: Vec::new(),
        }
    }
}

/// Outcome of [`ScopeFilter::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Admit(Arc<ScopeSettings>),
    /// An exclusion matched.
    Excluded,
    /// No inclusion matched.
    NotIncluded,
    /// The deciding inclusion does not cover the operation.
    OperationNotIncluded,
    /// The deciding inclusion lists the invoking user.
    UserExcluded,
    /// DDL without a known target, dropped by policy.
    UnparseableDdl,
}

impl ScopeDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::Admit(_) => "admitted",
            Self::Excluded => "excluded",
            Self::NotIncluded => "not_included",
            Self::OperationNotIncluded => "operation",
            Self::UserExcluded => "user",
            Self::UnparseableDdl => "unparseable_ddl",
        }
    }
}

/// A mutation that passed the filter, with the settings of its scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub mutation: RawMutation,
    pub settings: Arc<ScopeSettings>,
}

impl Admitted {
    /// Build the committed event at position `seq` of its transaction.
    pub fn into_event(self, seq: u32) -> ChangeEvent {
        let mut event = ChangeEvent::committed(self.mutation, seq, &self.settings.primary_key);
        mask::mask_event(&mut event, &self.settings.sensitive_columns);
        event
    }
}

#[derive(Debug)]
struct Include {
    database: GlobMatcher,
    table: GlobMatcher,
    operations: Vec<Operation>,
    exclude_users: Vec<String>,
    settings: Arc<ScopeSettings>,
    /// (exactness rank, literal characters); higher wins.
    specificity: (u8, usize),
}

#[derive(Debug)]
struct Exclude {
    database: GlobMatcher,
    table: GlobMatcher,
    operations: Vec<Operation>,
    users: Vec<String>,
}

/// Compiled scope rules.
#[derive(Debug)]
pub struct ScopeFilter {
    /// Most specific first; declaration order among equals.
    includes: Vec<Include>,
    excludes: Vec<Exclude>,
    unparseable_ddl: UnparseableDdlPolicy,
    unscoped: Arc<ScopeSettings>,
}

impl ScopeFilter {
    /// Compile `config`. Any bad pattern fails here, never at runtime.
    pub fn from_config(config: &ScopeConfig) -> Result<Self, CdcError> {
        let mut includes = Vec::with_capacity(config.include.len());
        for (i, rule) in config.include.iter().enumerate() {
            includes.push(Include {
                database: compile_glob(&format!("scope.include[{i}].database"), &rule.database)?,
                table: compile_glob(&format!("scope.include[{i}].table"), &rule.table)?,
                operations: rule.operations.clone(),
                exclude_users: rule.exclude_users.clone(),
                settings: Arc::new(ScopeSettings {
                    primary_key: rule.primary_key.clone(),
                    track_columns: rule.track_columns.clone(),
                    sensitive_columns: rule.sensitive_columns.clone(),
                }),
                specificity: specificity(&rule.database, &rule.table),
            });
        }
        // stable: declaration order survives among equal specificity
        includes.sort_by(|a, b| b.specificity.cmp(&a.specificity));

        let mut excludes = Vec::with_capacity(config.exclude.len());
        for (i, rule) in config.exclude.iter().enumerate() {
            excludes.push(Exclude {
                database: compile_glob(&format!("scope.exclude[{i}].database"), &rule.database)?,
                table: compile_glob(&format!("scope.exclude[{i}].table"), &rule.table)?,
                operations: rule.operations.clone(),
                users: rule.users.clone(),
            });
        }

        Ok(Self {
            includes,
            excludes,
            unparseable_ddl: config.unparseable_ddl,
            unscoped: Arc::new(ScopeSettings::default()),
        })
    }

    /// Whether `mutation` is in scope.
    pub fn matches(&self, mutation: &RawMutation) -> bool {
        self.decide(mutation).is_admit()
    }

    pub fn decide(&self, mutation: &RawMutation) -> ScopeDecision {
        let excluded = self.excludes.iter().any(|rule| {
            rule.database.is_match(&mutation.database)
                && rule.table.is_match(&mutation.table)
                && covers(&rule.operations, mutation.operation)
                && (rule.users.is_empty() || user_listed(&rule.users, mutation.user.as_deref()))
        });
        if excluded {
            return ScopeDecision::Excluded;
        }

        if mutation.is_unparseable_ddl() {
            return match self.unparseable_ddl {
                UnparseableDdlPolicy::Surface => ScopeDecision::Admit(Arc::clone(&self.unscoped)),
                UnparseableDdlPolicy::Drop => ScopeDecision::UnparseableDdl,
            };
        }

        if self.includes.is_empty() {
            return ScopeDecision::Admit(Arc::clone(&self.unscoped));
        }

        let Some(rule) = self.includes.iter().find(|rule| {
            rule.database.is_match(&mutation.database) && rule.table.is_match(&mutation.table)
        }) else {
            return ScopeDecision::NotIncluded;
        };

        if !covers(&rule.operations, mutation.operation) {
            return ScopeDecision::OperationNotIncluded;
        }
        if user_listed(&rule.exclude_users, mutation.user.as_deref()) {
            return ScopeDecision::UserExcluded;
        }
        ScopeDecision::Admit(Arc::clone(&rule.settings))
    }

    /// Filter and project `mutation`. `None` when it is out of scope.
    pub fn admit(&self, mut mutation: RawMutation) -> Option<Admitted> {
        let decision = self.decide(&mutation);
        let settings = match decision {
            ScopeDecision::Admit(settings) => settings,
            ScopeDecision::UnparseableDdl => {
                counter!(m::SCOPE_UNPARSEABLE_DDL_TOTAL).increment(1);
                warn!(
                    position = %mutation.position,
                    database = %mutation.database,
                    statement = mutation.ddl.as_ref().map(|d| d.statement.as_str()).unwrap_or_default(),
                    "dropping DDL with unparseable target"
                );
                return None;
            }
            rejected => {
                counter!(
                    m::PIPELINE_EVENTS_FILTERED_TOTAL,
                    m::LABEL_REASON => rejected.reason()
                )
                .increment(1);
                debug!(
                    table = %mutation.qualified_table(),
                    operation = %mutation.operation,
                    reason = rejected.reason(),
                    "mutation out of scope"
                );
                return None;
            }
        };

        if !settings.track_columns.is_empty() {
            for image in [mutation.before.as_mut(), mutation.after.as_mut()]
                .into_iter()
                .flatten()
            {
                project(image, &settings);
            }
        }
        Some(Admitted { mutation, settings })
    }
}

fn covers(operations: &[Operation], operation: Operation) -> bool {
    operations.is_empty() || operations.contains(&operation)
}

/// `users` entries match either the full `user@host` or the bare user.
fn user_listed(users: &[String], invoker: Option<&str>) -> bool {
    let Some(invoker) = invoker else {
        return false;
    };
    let bare = invoker.split_once('@').map_or(invoker, |(user, _)| user);
    users
        .iter()
        .any(|u| u.eq_ignore_ascii_case(invoker) || u.eq_ignore_ascii_case(bare))
}

fn project(image: &mut RowImage, settings: &ScopeSettings) {
    image.retain(|column, _| {
        settings.track_columns.contains(column) || settings.primary_key.contains(column)
    });
}

fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', ']', '{', '}'])
}

fn specificity(database: &str, table: &str) -> (u8, usize) {
    let rank = match (is_literal(database), is_literal(table)) {
        (true, true) => 3,
        (true, false) => 2,
        (false, true) => 1,
        (false, false) => 0,
    };
    let literals = database
        .chars()
        .chain(table.chars())
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
        .count();
    (rank, literals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use binwatch_core::config::{ExcludeScope, IncludeScope};
    use binwatch_core::ddl::DdlKind;
    use binwatch_core::types::{DdlInfo, StreamPosition};
    use chrono::Utc;
    use serde_json::json;

    fn mutation(db: &str, table: &str, op: Operation, user: Option<&str>) -> RawMutation {
        RawMutation {
            operation: op,
            database: db.to_owned(),
            table: table.to_owned(),
            before: None,
            after: Some(
                [
                    ("id".to_owned(), json!(7)),
                    ("email".to_owned(), json!("alice@example.com")),
                    ("note".to_owned(), json!("hello")),
                ]
                .into_iter()
                .collect(),
            ),
            position: StreamPosition::new("mysql-bin.000001", 500),
            txn_id: "mysql-bin.000001:300".to_owned(),
            timestamp: Utc::now(),
            user: user.map(str::to_owned),
            ddl: None,
        }
    }

    fn include(db: &str, table: &str, ops: &[Operation]) -> IncludeScope {
        IncludeScope {
            database: db.to_owned(),
            table: table.to_owned(),
            operations: ops.to_vec(),
            ..Default::default()
        }
    }

    fn filter(config: ScopeConfig) -> ScopeFilter {
        ScopeFilter::from_config(&config).unwrap()
    }

    #[test]
    fn no_includes_admits_everything_not_excluded() {
        let f = filter(ScopeConfig {
            exclude: vec![ExcludeScope {
                database: "mysql".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(f.matches(&mutation("shop", "users", Operation::Insert, None)));
        assert_eq!(
            f.decide(&mutation("mysql", "user", Operation::Insert, None)),
            ScopeDecision::Excluded
        );
    }

    #[test]
    fn exclusion_for_user_beats_inclusion() {
        let f = filter(ScopeConfig {
            include: vec![include("shop", "orders", &[])],
            exclude: vec![ExcludeScope {
                database: "shop".to_owned(),
                table: "orders".to_owned(),
                users: vec!["etl".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        });
        let by_etl = mutation("shop", "orders", Operation::Update, Some("etl@10.0.0.5"));
        assert_eq!(f.decide(&by_etl), ScopeDecision::Excluded);
        let by_app = mutation("shop", "orders", Operation::Update, Some("app@10.0.0.6"));
        assert!(f.matches(&by_app));
    }

    #[test]
    fn exact_include_wins_over_wildcard() {
        let f = filter(ScopeConfig {
            include: vec![
                include("shop", "*", &[Operation::Insert, Operation::Update, Operation::Delete]),
                include("shop", "audit_log", &[Operation::Insert]),
            ],
            ..Default::default()
        });
        // the exact scope decides: deletes on audit_log are out
        assert_eq!(
            f.decide(&mutation("shop", "audit_log", Operation::Delete, None)),
            ScopeDecision::OperationNotIncluded
        );
        assert!(f.matches(&mutation("shop", "orders", Operation::Delete, None)));
    }

    #[test]
    fn literal_count_breaks_ties() {
        let f = filter(ScopeConfig {
            include: vec![
                include("*", "*", &[]),
                include("shop*", "*", &[Operation::Insert]),
            ],
            ..Default::default()
        });
        assert_eq!(
            f.decide(&mutation("shop_eu", "orders", Operation::Update, None)),
            ScopeDecision::OperationNotIncluded
        );
        assert!(f.matches(&mutation("billing", "orders", Operation::Update, None)));
    }

    #[test]
    fn unmatched_table_is_not_included() {
        let f = filter(ScopeConfig {
            include: vec![include("shop", "users", &[])],
            ..Default::default()
        });
        assert_eq!(
            f.decide(&mutation("shop", "orders", Operation::Insert, None)),
            ScopeDecision::NotIncluded
        );
    }

    #[test]
    fn include_exclude_users_match_bare_or_full_account() {
        let mut scope = include("shop", "users", &[]);
        scope.exclude_users = vec!["Replicator".to_owned(), "admin@localhost".to_owned()];
        let f = filter(ScopeConfig {
            include: vec![scope],
            ..Default::default()
        });
        let by = |u| mutation("shop", "users", Operation::Update, Some(u));
        assert_eq!(f.decide(&by("replicator@%")), ScopeDecision::UserExcluded);
        assert_eq!(f.decide(&by("admin@localhost")), ScopeDecision::UserExcluded);
        assert!(f.matches(&by("admin@10.1.1.1")));
        assert!(f.matches(&mutation("shop", "users", Operation::Update, None)));
    }

    #[test]
    fn globs_are_case_insensitive() {
        let f = filter(ScopeConfig {
            include: vec![include("Shop", "user?", &[])],
            ..Default::default()
        });
        assert!(f.matches(&mutation("shop", "USERS", Operation::Insert, None)));
    }

    fn ddl(db: &str, table: &str, parsed: bool) -> RawMutation {
        let mut m = mutation(db, table, Operation::Ddl, None);
        m.after = None;
        m.ddl = Some(DdlInfo {
            statement: "ALTER TABLE users ADD COLUMN age INT".to_owned(),
            kind: Some(DdlKind::Alter),
            parsed,
        });
        m
    }

    #[test]
    fn ddl_uses_parsed_table() {
        let f = filter(ScopeConfig {
            include: vec![include("shop", "users", &[])],
            ..Default::default()
        });
        assert!(f.matches(&ddl("shop", "users", true)));
        assert!(!f.matches(&ddl("shop", "orders", true)));
    }

    #[test]
    fn unparseable_ddl_follows_policy() {
        let drop = filter(ScopeConfig::default());
        assert_eq!(drop.decide(&ddl("shop", "", false)), ScopeDecision::UnparseableDdl);
        assert!(drop.admit(ddl("shop", "", false)).is_none());

        let surface = filter(ScopeConfig {
            include: vec![include("billing", "*", &[])],
            unparseable_ddl: UnparseableDdlPolicy::Surface,
            ..Default::default()
        });
        assert!(surface.matches(&ddl("shop", "", false)));
    }

    #[test]
    fn excluded_database_hides_unparseable_ddl() {
        let f = filter(ScopeConfig {
            exclude: vec![ExcludeScope {
                database: "tmp_*".to_owned(),
                ..Default::default()
            }],
            unparseable_ddl: UnparseableDdlPolicy::Surface,
            ..Default::default()
        });
        assert_eq!(f.decide(&ddl("tmp_import", "", false)), ScopeDecision::Excluded);
    }

    #[test]
    fn admit_projects_and_event_masks() {
        let mut scope = include("shop", "users", &[]);
        scope.track_columns = vec!["email".to_owned()];
        scope.sensitive_columns = vec!["email".to_owned()];
        let f = filter(ScopeConfig {
            include: vec![scope],
            ..Default::default()
        });
        let admitted = f
            .admit(mutation("shop", "users", Operation::Insert, None))
            .unwrap();
        let after = admitted.mutation.after.as_ref().unwrap();
        assert!(after.contains_key("id"));
        assert!(!after.contains_key("note"));

        let event = admitted.into_event(0);
        let after = event.after.as_ref().unwrap();
        assert_eq!(after["email"], json!("al***@example.com"));
        assert_eq!(event.primary_key["id"], json!(7));
    }

    #[test]
    fn bad_pattern_fails_compilation() {
        let config = ScopeConfig {
            include: vec![include("shop[", "*", &[])],
            ..Default::default()
        };
        assert!(ScopeFilter::from_config(&config).is_err());
    }
}
