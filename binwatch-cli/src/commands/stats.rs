//! `binwatch stats` handler.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use binwatch_core::config::BinwatchConfig;
use binwatch_store::StoreStats;

use super::open_store;
use crate::error::CliError;
use crate::output::{OutputWriter, Render, clip, timestamp};

pub async fn execute(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await?;
    let store = open_store(&config)?;
    let report = StatsReport {
        store: config.store.path.clone(),
        stats: store.stats()?,
    };
    writer.render(&report)?;
    Ok(())
}

#[derive(Serialize)]
pub struct StatsReport {
    pub store: String,
    #[serde(flatten)]
    pub stats: StoreStats,
}

impl Render for StatsReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        let s = &self.stats;
        writeln!(w, "Change Store: {}", self.store.bold())?;
        writeln!(w, "  Changes: {}", s.total_changes.to_string().bold())?;
        writeln!(w, "  Alerts:  {}", s.total_alerts.to_string().bold())?;
        writeln!(
            w,
            "  Events:  {} .. {}",
            timestamp(s.first_event_at),
            timestamp(s.last_event_at)
        )?;

        if !s.by_operation.is_empty() {
            let ops: Vec<String> = s
                .by_operation
                .iter()
                .map(|(op, n)| format!("{op}={n}"))
                .collect();
            writeln!(w, "  By operation: {}", ops.join(" "))?;
        }
        if !s.alerts_by_severity.is_empty() {
            let sev: Vec<String> = s
                .alerts_by_severity
                .iter()
                .map(|(k, n)| format!("{k}={n}"))
                .collect();
            writeln!(w, "  Alerts by severity: {}", sev.join(" "))?;
        }
        if !s.alerts_by_status.is_empty() {
            let st: Vec<String> = s
                .alerts_by_status
                .iter()
                .map(|(k, n)| format!("{k}={n}"))
                .collect();
            writeln!(w, "  Alerts by status: {}", st.join(" "))?;
        }

        if !s.by_table.is_empty() {
            writeln!(w)?;
            writeln!(
                w,
                "{:<32} {:>9} {:>9} {:>9} {:>6} {:>10}",
                "Table", "Inserts", "Updates", "Deletes", "DDL", "Total"
            )?;
            writeln!(w, "{}", "-".repeat(80))?;
            for t in &s.by_table {
                writeln!(
                    w,
                    "{:<32} {:>9} {:>9} {:>9} {:>6} {:>10}",
                    clip(&format!("{}.{}", t.database, t.table), 32),
                    t.inserts,
                    t.updates,
                    t.deletes,
                    t.ddl,
                    t.total
                )?;
            }
        }

        if !s.daily.is_empty() {
            writeln!(w)?;
            writeln!(w, "Daily changes (last 30 days)")?;
            for day in &s.daily {
                writeln!(w, "  {}  {:>10}", day.date, day.count)?;
            }
        }
        Ok(())
    }
}
