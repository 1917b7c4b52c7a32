//! `binwatch changes` handler.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use binwatch_core::config::BinwatchConfig;
use binwatch_core::types::{ChangeEvent, Operation};
use binwatch_store::{ChangeQuery, ChangeStore, pk_text};

use super::{open_store, time_bound};
use crate::cli::ChangesArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render, clip, timestamp};

pub async fn execute(
    args: ChangesArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = BinwatchConfig::load(config_path).await?;
    let store = open_store(&config)?;
    let report = query(&store, &args)?;
    writer.render(&report)?;
    Ok(())
}

pub fn query(store: &ChangeStore, args: &ChangesArgs) -> Result<ChangesReport, CliError> {
    if args.limit == 0 {
        return Err(CliError::Command("--limit must be greater than 0".to_owned()));
    }

    if args.history {
        let (database, table) = target(args.database.as_deref(), args.table.as_deref())?;
        let pk = args.pk.as_deref().unwrap_or_default();
        let changes = store.record_history(database, table, pk)?;
        return Ok(ChangesReport {
            history: Some(format!("{database}.{table} [{pk}]")),
            total: changes.len(),
            changes,
        });
    }

    let operation = args
        .operation
        .as_deref()
        .map(|op| {
            Operation::from_str_loose(op).ok_or_else(|| {
                CliError::Command(format!(
                    "unknown operation '{op}' (expected INSERT, UPDATE, DELETE or DDL)"
                ))
            })
        })
        .transpose()?;

    let query = ChangeQuery {
        database: args.database.clone(),
        table: args.table.clone(),
        from: time_bound("from", args.from.as_deref())?,
        to: time_bound("to", args.to.as_deref())?,
        operation,
        primary_key: args.pk.clone(),
        limit: args.limit,
        offset: args.offset,
    };
    let changes = store.query_changes(&query)?;
    Ok(ChangesReport {
        history: None,
        total: changes.len(),
        changes,
    })
}

/// `(database, table)` from `--database` plus `--table`, or a qualified
/// `--table db.table`.
fn target<'a>(
    database: Option<&'a str>,
    table: Option<&'a str>,
) -> Result<(&'a str, &'a str), CliError> {
    match (database, table) {
        (Some(db), Some(table)) => Ok((db, table)),
        (None, Some(qualified)) => qualified.split_once('.').ok_or_else(|| {
            CliError::Command("--history needs --database or a qualified --table db.table".to_owned())
        }),
        _ => Err(CliError::Command("--history needs --table".to_owned())),
    }
}

#[derive(Serialize)]
pub struct ChangesReport {
    /// Set for `--history`: the row being traced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    pub total: usize,
    pub changes: Vec<ChangeEvent>,
}

impl Render for ChangesReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        match &self.history {
            Some(row) => writeln!(w, "History of {} ({} changes)", row.bold(), self.total)?,
            None => writeln!(w, "Changes ({} shown)", self.total.to_string().bold())?,
        }
        if self.changes.is_empty() {
            return writeln!(w, "  {}", "no matching changes".dimmed());
        }
        writeln!(w)?;
        writeln!(
            w,
            "{:<19} {:<7} {:<28} {:<14} {:<26} Detail",
            "Time", "Op", "Table", "Key", "Position"
        )?;
        writeln!(w, "{}", "-".repeat(110))?;

        for event in &self.changes {
            let op = match event.operation {
                Operation::Insert => event.operation.as_str().green(),
                Operation::Update => event.operation.as_str().yellow(),
                Operation::Delete => event.operation.as_str().red(),
                Operation::Ddl => event.operation.as_str().magenta(),
            };
            writeln!(
                w,
                "{:<19} {:<7} {:<28} {:<14} {:<26} {}",
                timestamp(Some(event.timestamp)),
                op,
                clip(&event.qualified_table(), 28),
                clip(&pk_text(&event.primary_key), 14),
                format!("{}#{}", event.position, event.seq),
                clip(&detail(event), 60)
            )?;
        }
        Ok(())
    }
}

/// Changed columns for UPDATE, the statement for DDL.
fn detail(event: &ChangeEvent) -> String {
    if let Some(ddl) = &event.ddl {
        return ddl.statement.clone();
    }
    if event.changes.is_empty() {
        return String::new();
    }
    event
        .changes
        .iter()
        .map(|(col, change)| format!("{col}: {} -> {}", change.old, change.new))
        .collect::<Vec<_>>()
        .join(", ")
}
