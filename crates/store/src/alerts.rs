//! Alert persistence and delivery history.

use binwatch_core::types::{Alert, DeliveryStatus, Severity};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Row, params, params_from_iter};
use tracing::debug;

use crate::error::StoreError;
use crate::query::{AlertQuery, DeliveryRecord};
use crate::store::{ChangeStore, conversion_error, json_column, opt_json_column};

const ALERT_COLUMNS: &str = "id, rule_id, rule_title, severity, alert_key, summary, event, \
     window_summary, channels, created_at, delivery_status";

impl ChangeStore {
    /// Persist a new alert. Returns `false` if an alert with the same id is
    /// already stored.
    pub fn append_alert(&self, alert: &Alert) -> Result<bool, StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO alerts (id, rule_id, rule_title, severity, severity_rank, \
             alert_key, summary, database_name, table_name, operation, event, window_summary, \
             channels, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                alert.id,
                alert.rule_id,
                alert.rule_title,
                alert.severity.as_str(),
                severity_rank(alert.severity),
                alert.key,
                alert.summary,
                alert.event.as_ref().map(|e| e.database.as_str()),
                alert.event.as_ref().map(|e| e.table.as_str()),
                alert.operation().map(|op| op.as_str()),
                alert.event.as_ref().map(serde_json::to_string).transpose()?,
                alert.window.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&alert.channels)?,
                alert.created_at.timestamp_millis(),
            ],
        )? == 1;

        if inserted && alert.delivery_status != DeliveryStatus::Pending {
            insert_delivery(
                &tx,
                &alert.id,
                &DeliveryRecord::summary(alert.delivery_status, 0, None),
            )?;
        }
        tx.commit()?;
        debug!(alert_id = %alert.id, rule_id = %alert.rule_id, inserted, "alert stored");
        Ok(inserted)
    }

    /// Append a delivery outcome. The latest summary record is the alert's
    /// delivery status.
    pub fn record_delivery(&self, alert_id: &str, record: &DeliveryRecord) -> Result<(), StoreError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        insert_delivery(&tx, alert_id, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Delivery records of one alert, oldest first.
    pub fn deliveries(&self, alert_id: &str) -> Result<Vec<DeliveryRecord>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT channel, status, attempts, error, recorded_at FROM alert_deliveries \
             WHERE alert_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![alert_id], |row| {
            let status: String = row.get(1)?;
            let recorded_at: i64 = row.get(4)?;
            Ok(DeliveryRecord {
                channel: row.get(0)?,
                status: DeliveryStatus::from_str_loose(&status)
                    .ok_or_else(|| conversion_error(1, format!("unknown status {status}")))?,
                attempts: row.get(2)?,
                error: row.get(3)?,
                recorded_at: millis(recorded_at, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Alerts matching `query`, newest first.
    pub fn query_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>, StoreError> {
        let mut sql = format!("SELECT {ALERT_COLUMNS} FROM alerts_with_status WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        if let Some(from) = query.from {
            sql.push_str(" AND created_at >= ?");
            args.push(Value::Integer(from.timestamp_millis()));
        }
        if let Some(to) = query.to {
            sql.push_str(" AND created_at <= ?");
            args.push(Value::Integer(to.timestamp_millis()));
        }
        if let Some(severity) = query.severity {
            sql.push_str(" AND severity_rank >= ?");
            args.push(Value::Integer(severity_rank(severity)));
        }
        if let Some(status) = query.status {
            sql.push_str(" AND delivery_status = ?");
            args.push(Value::Text(status.as_str().to_owned()));
        }
        if let Some(rule_id) = &query.rule_id {
            sql.push_str(" AND rule_id = ?");
            args.push(Value::Text(rule_id.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC, row_order DESC LIMIT ?");
        args.push(Value::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), alert_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Alerts created at or after `since`, oldest first.
    pub fn recent_alerts(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts_with_status WHERE created_at >= ?1 \
             ORDER BY created_at, row_order"
        ))?;
        let rows = stmt.query_map(params![since.timestamp_millis()], alert_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn insert_delivery(
    tx: &rusqlite::Transaction<'_>,
    alert_id: &str,
    record: &DeliveryRecord,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO alert_deliveries (alert_id, channel, status, attempts, error, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            alert_id,
            record.channel,
            record.status.as_str(),
            record.attempts,
            record.error,
            record.recorded_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn severity_rank(severity: Severity) -> i64 {
    match severity {
        Severity::Info => 0,
        Severity::Low => 1,
        Severity::Medium => 2,
        Severity::High => 3,
        Severity::Critical => 4,
    }
}

fn millis(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, format!("timestamp {ms} out of range")))
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        rule_title: row.get(2)?,
        severity: Severity::from_str_loose(&severity)
            .ok_or_else(|| conversion_error(3, format!("unknown severity {severity}")))?,
        key: row.get(4)?,
        summary: row.get(5)?,
        event: opt_json_column(row, 6)?,
        window: opt_json_column(row, 7)?,
        channels: json_column(row, 8)?,
        created_at: millis(row.get(9)?, 9)?,
        delivery_status: DeliveryStatus::from_str_loose(&status)
            .ok_or_else(|| conversion_error(10, format!("unknown status {status}")))?,
    })
}
