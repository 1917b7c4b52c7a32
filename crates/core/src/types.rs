//! Domain types shared across the binlog reader, pipeline, store and notifier.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ddl::DdlKind;
use crate::error::ParseError;

/// Column name → decoded value.
pub type RowImage = BTreeMap<String, serde_json::Value>;

/// Row-level operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[serde(alias = "insert")]
    Insert,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "ddl")]
    Ddl,
}

impl Operation {
    /// Every operation kind, in display order.
    pub const ALL: [Operation; 4] = [Self::Insert, Self::Update, Self::Delete, Self::Ddl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
        }
    }

    /// Case-insensitive parse.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "DDL" => Some(Self::Ddl),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location in the source binary log.
///
/// Ordered by the numeric suffix of the log file name (`mysql-bin.000042`
/// sorts after `mysql-bin.000009`), then by file name, then by byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Binary log file name.
    pub file: String,
    /// Byte offset inside `file`.
    pub offset: u64,
}

impl StreamPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Numeric sequence suffix of the file name, if any.
    pub fn file_index(&self) -> Option<u64> {
        let (_, suffix) = self.file.rsplit_once('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }
}

impl Ord for StreamPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_index()
            .cmp(&other.file_index())
            .then_with(|| self.file.cmp(&other.file))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for StreamPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl FromStr for StreamPosition {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidPosition {
            input: s.to_owned(),
        };
        let (file, offset) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if file.is_empty() {
            return Err(invalid());
        }
        let offset = offset.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(file, offset))
    }
}

/// Parse a user-supplied time bound. Accepts RFC 3339, or a naive
/// `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DD` taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ParseError::InvalidTimestamp {
            input: s.to_owned(),
        })
}

/// DDL details carried on a [`RawMutation`] of kind [`Operation::Ddl`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlInfo {
    /// Statement text as logged by the source.
    pub statement: String,
    /// Statement family, when recognised.
    pub kind: Option<DdlKind>,
    /// Whether a target table name could be extracted.
    pub parsed: bool,
}

/// One row-level primitive decoded from the binary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMutation {
    pub operation: Operation,
    pub database: String,
    /// Empty for DDL whose target could not be parsed.
    pub table: String,
    /// Present for UPDATE and DELETE.
    pub before: Option<RowImage>,
    /// Present for INSERT and UPDATE.
    pub after: Option<RowImage>,
    /// End position of the log event carrying this row.
    pub position: StreamPosition,
    /// GTID when available, otherwise the position of the transaction's BEGIN.
    pub txn_id: String,
    /// Source commit timestamp (second resolution).
    pub timestamp: DateTime<Utc>,
    /// Invoking account, when the log records it.
    pub user: Option<String>,
    pub ddl: Option<DdlInfo>,
}

impl RawMutation {
    /// `database.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    /// DDL statement whose target table could not be determined.
    pub fn is_unparseable_ddl(&self) -> bool {
        self.ddl.as_ref().is_some_and(|d| !d.parsed)
    }
}

/// Old and new value of one column changed by an UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Canonical, committed change record consumed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub database: String,
    pub table: String,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub position: StreamPosition,
    pub txn_id: String,
    pub timestamp: DateTime<Utc>,
    pub user: Option<String>,
    pub ddl: Option<DdlInfo>,
    /// Order within the transaction, starting at 0.
    pub seq: u32,
    /// Set once the transaction's commit marker has been seen.
    pub committed: bool,
    /// Projection of the row onto its key columns.
    #[serde(default)]
    pub primary_key: RowImage,
    /// Per-column diff for UPDATE.
    #[serde(default)]
    pub changes: BTreeMap<String, ColumnChange>,
}

impl ChangeEvent {
    /// Build a committed event from a buffered mutation.
    ///
    /// The primary key is taken from the after-image, falling back to the
    /// before-image for deletes. Missing key columns are skipped.
    pub fn committed(mutation: RawMutation, seq: u32, key_columns: &[String]) -> Self {
        let primary_key = {
            let image = mutation.after.as_ref().or(mutation.before.as_ref());
            let mut key = RowImage::new();
            if let Some(image) = image {
                for column in key_columns {
                    if let Some(value) = image.get(column) {
                        key.insert(column.clone(), value.clone());
                    }
                }
            }
            key
        };
        let changes = match (&mutation.before, &mutation.after) {
            (Some(before), Some(after)) => diff_images(before, after),
            _ => BTreeMap::new(),
        };

        Self {
            operation: mutation.operation,
            database: mutation.database,
            table: mutation.table,
            before: mutation.before,
            after: mutation.after,
            position: mutation.position,
            txn_id: mutation.txn_id,
            timestamp: mutation.timestamp,
            user: mutation.user,
            ddl: mutation.ddl,
            seq,
            committed: true,
            primary_key,
            changes,
        }
    }

    /// `database.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

fn diff_images(before: &RowImage, after: &RowImage) -> BTreeMap<String, ColumnChange> {
    let mut changes = BTreeMap::new();
    for (column, new) in after {
        let old = before.get(column).cloned().unwrap_or(serde_json::Value::Null);
        if &old != new {
            changes.insert(
                column.clone(),
                ColumnChange {
                    old,
                    new: new.clone(),
                },
            );
        }
    }
    for (column, old) in before {
        if !after.contains_key(column) {
            changes.insert(
                column.clone(),
                ColumnChange {
                    old: old.clone(),
                    new: serde_json::Value::Null,
                },
            );
        }
    }
    changes
}

/// Durable resume marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Position to resume streaming from.
    pub position: StreamPosition,
    /// True when `position` is the end of a committed transaction.
    pub tx_boundary: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checkpoint at the end of a committed transaction.
    pub fn at_commit(position: StreamPosition) -> Self {
        Self {
            position,
            tx_boundary: true,
            updated_at: Utc::now(),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.position)?;
        if !self.tx_boundary {
            f.write_str(" (mid-transaction)")?;
        }
        Ok(())
    }
}

/// Alert severity. `Info < Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Case-insensitive parse.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" | "informational" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of notifying an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    Suppressed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "suppressed" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate that made a windowed rule fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    /// Value of the rule's group-by field.
    pub group_key: String,
    /// Matching rows inside the window when the rule fired.
    pub count: u64,
    pub window_secs: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Alert raised by the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_title: String,
    pub severity: Severity,
    /// De-duplication key, e.g. `shop.orders`.
    pub key: String,
    /// Human-readable reason.
    pub summary: String,
    /// Triggering event for stateless rules.
    pub event: Option<ChangeEvent>,
    /// Window aggregate for windowed rules.
    pub window: Option<WindowSummary>,
    /// Target channel names.
    pub channels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

impl Alert {
    /// Table the alert is about, if it can be determined.
    pub fn table(&self) -> Option<String> {
        self.event.as_ref().map(ChangeEvent::qualified_table)
    }

    /// Operation of the triggering event, if any.
    pub fn operation(&self) -> Option<Operation> {
        self.event.as_ref().map(|e| e.operation)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (rule: {}, key: {})",
            self.severity, self.rule_title, self.rule_id, self.key
        )
    }
}
