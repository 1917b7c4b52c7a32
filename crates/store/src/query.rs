//! Query parameters and aggregate result types.

use std::collections::BTreeMap;

use binwatch_core::types::{DeliveryStatus, Operation, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default page size for change and alert queries.
pub const DEFAULT_LIMIT: usize = 100;

/// Filter for [`ChangeStore::query_changes`](crate::ChangeStore::query_changes).
///
/// `table` may be qualified (`shop.users`) when `database` is unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeQuery {
    pub database: Option<String>,
    pub table: Option<String>,
    /// Inclusive lower bound on event time.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on event time.
    pub to: Option<DateTime<Utc>>,
    pub operation: Option<Operation>,
    /// Primary key values joined by `,`, e.g. `7` or `3,eu`.
    pub primary_key: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ChangeQuery {
    fn default() -> Self {
        Self {
            database: None,
            table: None,
            from: None,
            to: None,
            operation: None,
            primary_key: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl ChangeQuery {
    /// `(database, table)` after splitting a qualified table name.
    pub fn target(&self) -> (Option<&str>, Option<&str>) {
        match (self.database.as_deref(), self.table.as_deref()) {
            (None, Some(table)) => match table.split_once('.') {
                Some((db, table)) => (Some(db), Some(table)),
                None => (None, Some(table)),
            },
            other => other,
        }
    }
}

/// Filter for [`ChangeStore::query_alerts`](crate::ChangeStore::query_alerts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Minimum severity.
    pub severity: Option<Severity>,
    pub status: Option<DeliveryStatus>,
    pub rule_id: Option<String>,
    pub limit: usize,
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            severity: None,
            status: None,
            rule_id: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Outcome of delivering an alert, or of one channel's attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// `None` for the alert-level summary.
    pub channel: Option<String>,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Alert-level outcome.
    pub fn summary(status: DeliveryStatus, attempts: u32, error: Option<String>) -> Self {
        Self {
            channel: None,
            status,
            attempts,
            error,
            recorded_at: Utc::now(),
        }
    }

    /// Outcome for a single channel.
    pub fn channel(
        channel: impl Into<String>,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        Self {
            channel: Some(channel.into()),
            status,
            attempts,
            error,
            recorded_at: Utc::now(),
        }
    }
}

/// Per-table change counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub database: String,
    pub table: String,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub ddl: u64,
    pub total: u64,
}

/// Changes stored per calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    /// `YYYY-MM-DD`
    pub date: String,
    pub count: u64,
}

/// Aggregates served by `GET /stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_changes: u64,
    pub total_alerts: u64,
    pub by_operation: BTreeMap<String, u64>,
    pub by_table: Vec<TableStats>,
    /// Last 30 days, oldest first.
    pub daily: Vec<DailyCount>,
    pub alerts_by_severity: BTreeMap<String, u64>,
    pub alerts_by_status: BTreeMap<String, u64>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// A table that has stored changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub database: String,
    pub table: String,
    pub changes: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}
