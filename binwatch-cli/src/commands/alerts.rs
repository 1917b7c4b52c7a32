//! `binwatch alerts` handler.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use binwatch_core::config::BinwatchConfig;
use binwatch_core::types::{Alert, DeliveryStatus, Severity};
use binwatch_store::{AlertQuery, ChangeStore, DeliveryRecord};

use super::{open_store, time_bound};
use crate::cli::AlertsArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render, clip, timestamp};

pub async fn execute(
    args: AlertsArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await?;
    let store = open_store(&config)?;

    match &args.deliveries {
        Some(alert_id) => writer.render(&deliveries(&store, alert_id)?),
        None => writer.render(&query(&store, &args)?),
    }
}

pub fn query(store: &ChangeStore, args: &AlertsArgs) -> Result<AlertsReport, CliError> {
    if args.limit == 0 {
        return Err(CliError::Command("--limit must be greater than 0".to_owned()));
    }
    let severity = args
        .severity
        .as_deref()
        .map(|s| {
            Severity::from_str_loose(s).ok_or_else(|| {
                CliError::Command(format!(
                    "unknown severity '{s}' (expected info, low, medium, high or critical)"
                ))
            })
        })
        .transpose()?;
    let status = args
        .status
        .as_deref()
        .map(|s| {
            DeliveryStatus::from_str_loose(s).ok_or_else(|| {
                CliError::Command(format!(
                    "unknown status '{s}' (expected pending, delivered, failed or suppressed)"
                ))
            })
        })
        .transpose()?;

    let alerts = store.query_alerts(&AlertQuery {
        from: time_bound("from", args.from.as_deref())?,
        to: time_bound("to", args.to.as_deref())?,
        severity,
        status,
        rule_id: args.rule_id.clone(),
        limit: args.limit,
    })?;
    Ok(AlertsReport {
        total: alerts.len(),
        alerts,
    })
}

pub fn deliveries(store: &ChangeStore, alert_id: &str) -> Result<DeliveriesReport, CliError> {
    let records = store.deliveries(alert_id)?;
    if records.is_empty() {
        return Err(CliError::Command(format!(
            "no delivery records for alert '{alert_id}'"
        )));
    }
    Ok(DeliveriesReport {
        alert_id: alert_id.to_owned(),
        records,
    })
}

#[derive(Serialize)]
pub struct AlertsReport {
    pub total: usize,
    pub alerts: Vec<Alert>,
}

fn colored_severity(severity: Severity) -> colored::ColoredString {
    use colored::Colorize;
    match severity {
        Severity::Critical => severity.as_str().red().bold(),
        Severity::High => severity.as_str().red(),
        Severity::Medium => severity.as_str().yellow(),
        Severity::Low => severity.as_str().normal(),
        Severity::Info => severity.as_str().dimmed(),
    }
}

fn colored_status(status: DeliveryStatus) -> colored::ColoredString {
    use colored::Colorize;
    match status {
        DeliveryStatus::Delivered => status.as_str().green(),
        DeliveryStatus::Failed => status.as_str().red(),
        DeliveryStatus::Suppressed => status.as_str().dimmed(),
        DeliveryStatus::Pending => status.as_str().yellow(),
    }
}

impl Render for AlertsReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Alerts ({} shown, newest first)", self.total.to_string().bold())?;
        if self.alerts.is_empty() {
            return writeln!(w, "  {}", "no matching alerts".dimmed());
        }
        writeln!(w)?;
        writeln!(
            w,
            "{:<19} {:<9} {:<11} {:<22} {:<22} Summary",
            "Created", "Severity", "Status", "Rule", "Key"
        )?;
        writeln!(w, "{}", "-".repeat(110))?;
        for alert in &self.alerts {
            writeln!(
                w,
                "{:<19} {:<9} {:<11} {:<22} {:<22} {}",
                timestamp(Some(alert.created_at)),
                colored_severity(alert.severity),
                colored_status(alert.delivery_status),
                clip(&alert.rule_id, 22),
                clip(&alert.key, 22),
                clip(&alert.summary, 60)
            )?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
pub struct DeliveriesReport {
    pub alert_id: String,
    pub records: Vec<DeliveryRecord>,
}

impl Render for DeliveriesReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Deliveries of alert {}", self.alert_id.bold())?;
        writeln!(w)?;
        writeln!(
            w,
            "{:<19} {:<16} {:<11} {:<8} Error",
            "Recorded", "Channel", "Status", "Attempts"
        )?;
        writeln!(w, "{}", "-".repeat(80))?;
        for record in &self.records {
            writeln!(
                w,
                "{:<19} {:<16} {:<11} {:<8} {}",
                timestamp(Some(record.recorded_at)),
                record.channel.as_deref().unwrap_or("(overall)"),
                colored_status(record.status),
                record.attempts,
                record.error.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    fn args() -> AlertsArgs {
        AlertsArgs {
            from: None,
            to: None,
            severity: None,
            status: None,
            rule_id: None,
            limit: 100,
            deliveries: None,
        }
    }

    fn alert(id: &str, severity: Severity, minute: u32) -> Alert {
        Alert {
            id: id.to_owned(),
            rule_id: "orders-delete".to_owned(),
            rule_title: "Delete on orders".to_owned(),
            severity,
            key: "shop.orders".to_owned(),
            summary: "DELETE on shop.orders".to_owned(),
            event: None,
            window: None,
            channels: vec!["ops".to_owned()],
            created_at: Utc.with_ymd_and_hms(2026, 10, 16, 8, minute, 0).unwrap(),
            delivery_status: DeliveryStatus::Pending,
        }
    }

    fn seeded() -> (tempfile::TempDir, ChangeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ChangeStore::open_path(dir.path().join("binwatch.db"), Duration::from_secs(1)).unwrap();
        store.append_alert(&alert("a1", Severity::Low, 1)).unwrap();
        store.append_alert(&alert("a2", Severity::High, 2)).unwrap();
        store.append_alert(&alert("a3", Severity::Critical, 3)).unwrap();
        store
            .record_delivery(
                "a2",
                &DeliveryRecord::channel("ops", DeliveryStatus::Failed, 5, Some("HTTP 502".to_owned())),
            )
            .unwrap();
        store
            .record_delivery(
                "a2",
                &DeliveryRecord::summary(DeliveryStatus::Failed, 5, Some("all channels failed".to_owned())),
            )
            .unwrap();
        (dir, store)
    }

    #[test]
    fn severity_is_a_minimum() {
        let (_dir, store) = seeded();
        let report = query(
            &store,
            &AlertsArgs {
                severity: Some("HIGH".to_owned()),
                ..args()
            },
        )
        .unwrap();
        let ids: Vec<_> = report.alerts.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a3", "a2"]);
    }

    #[test]
    fn filters_by_delivery_status() {
        let (_dir, store) = seeded();
        let report = query(
            &store,
            &AlertsArgs {
                status: Some("failed".to_owned()),
                ..args()
            },
        )
        .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.alerts[0].id, "a2");
    }

    #[test]
    fn delivery_records_are_listed() {
        let (_dir, store) = seeded();
        let report = deliveries(&store, "a2").unwrap();
        assert_eq!(report.records.len(), 2);

        let mut out = Vec::new();
        report.render_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("HTTP 502"));
        assert!(text.contains("(overall)"));

        assert!(deliveries(&store, "missing").is_err());
    }

    #[test]
    fn unknown_filters_are_rejected() {
        let (_dir, store) = seeded();
        let bad = AlertsArgs {
            severity: Some("urgent".to_owned()),
            ..args()
        };
        assert!(query(&store, &bad).is_err());
        let bad = AlertsArgs {
            status: Some("sent".to_owned()),
            ..args()
        };
        assert!(query(&store, &bad).is_err());
    }
}
