//! Status command implementation

use anyhow::{Context, Result};
use serde::Serialize;
use tm_core::OpContext;
use tm_migrate::{MigrationStatus, SchemaState};

use crate::cli::{GlobalArgs, StatusArgs, StatusOutput};
use crate::commands::common::open_manager;

/// JSON document printed by `tm status -o json`
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    version: u64,
    dirty: bool,
    migrations: Vec<StatusEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct StatusEntry<'a> {
    version: u64,
    name: &'a str,
    applied: bool,
    reversible: bool,
    applied_at: Option<&'a str>,
}

/// Execute the status command
pub(crate) async fn execute(args: &StatusArgs, global: &GlobalArgs, ctx: &OpContext) -> Result<()> {
    let (_, mut manager) = open_manager(global, ctx).await?;
    let state = manager
        .get_version()
        .await
        .context("Failed to read schema version")?;
    let rows = manager
        .status()
        .await
        .context("Failed to read migration status")?;

    match args.output {
        StatusOutput::Table => print_table(&state, &rows),
        StatusOutput::Json => print_json(&state, &rows)?,
    }

    manager.close()?;
    Ok(())
}

fn print_table(state: &SchemaState, rows: &[MigrationStatus]) {
    let name_width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    println!(
        "{:<20} {:<name_width$} {:<8} {:<5} APPLIED AT",
        "VERSION", "NAME", "STATE", "DOWN"
    );
    for row in rows {
        println!(
            "{:<20} {:<name_width$} {:<8} {:<5} {}",
            row.version,
            row.name,
            if row.applied { "applied" } else { "pending" },
            if row.reversible { "yes" } else { "no" },
            row.applied_at.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("version: {} (dirty: {})", state.version, state.dirty);
}

fn print_json(state: &SchemaState, rows: &[MigrationStatus]) -> Result<()> {
    let report = StatusReport {
        version: state.version,
        dirty: state.dirty,
        migrations: rows
            .iter()
            .map(|row| StatusEntry {
                version: row.version,
                name: &row.name,
                applied: row.applied,
                reversible: row.reversible,
                applied_at: row.applied_at.as_deref(),
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize status")?;
    println!("{json}");
    Ok(())
}
