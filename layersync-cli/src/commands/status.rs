//! `layersync status`: latest run of every registered layer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use layersync_core::registry;
use layersync_engine::{run_log, RunRecord, RunStatus};

use super::home_dir;

/// Arguments for `layersync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let layers = registry::list_layers_at(&home)
            .context("failed to load layer definitions")?;

        let mut rows = Vec::with_capacity(layers.len());
        for def in layers {
            let last_run = run_log::load_at(&home, &def.name)
                .with_context(|| format!("failed to load run log for '{}'", def.name))?;
            rows.push(LayerStatus {
                layer: def.name.0,
                destination: def.destination.0,
                last_run,
            });
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(rows);
        Ok(())
    }
}

#[derive(Serialize)]
struct LayerStatus {
    layer: String,
    destination: String,
    last_run: Option<RunRecord>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "layer")]
    layer: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "last run")]
    last_run: String,
    #[tabled(rename = "rows")]
    rows: String,
    #[tabled(rename = "detail")]
    detail: String,
}

fn print_table(rows: Vec<LayerStatus>) {
    let failing = rows
        .iter()
        .filter(|r| {
            r.last_run
                .as_ref()
                .is_some_and(|run| !matches!(run.status, RunStatus::Succeeded))
        })
        .count();
    println!(
        "layersync v{} | {} layers | {} need attention",
        env!("CARGO_PKG_VERSION"),
        rows.len(),
        failing
    );
    if rows.is_empty() {
        println!("No layers registered.");
        return;
    }

    let now = Utc::now();
    let table_rows: Vec<StatusTableRow> = rows
        .into_iter()
        .map(|row| match row.last_run {
            None => StatusTableRow {
                layer: row.layer,
                status: "never run".bright_black().to_string(),
                last_run: "never".into(),
                rows: "-".into(),
                detail: String::new(),
            },
            Some(run) => StatusTableRow {
                layer: row.layer,
                status: status_label(&run.status),
                last_run: format_age(run.finished_at, now),
                rows: run
                    .sync
                    .as_ref()
                    .map_or_else(|| "-".into(), |s| s.post_count.to_string()),
                detail: status_detail(&run),
            },
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn status_label(status: &RunStatus) -> String {
    match status {
        RunStatus::Succeeded => status.label().green().to_string(),
        RunStatus::PropagationFailed => status.label().yellow().to_string(),
        RunStatus::Failed { .. } => status.label().red().to_string(),
    }
}

fn status_detail(run: &RunRecord) -> String {
    match &run.status {
        RunStatus::Failed { stage, .. } => format!("stopped at {stage}"),
        RunStatus::PropagationFailed => {
            let failed: Vec<&str> = run
                .propagation
                .iter()
                .flat_map(|p| {
                    [("raster", &p.raster), ("archive", &p.archive), ("mirror", &p.mirror)]
                })
                .filter(|(_, outcome)| outcome.is_failed())
                .map(|(action, _)| action)
                .collect();
            format!("{} failed", failed.join(", "))
        }
        RunStatus::Succeeded if !run.warnings.is_empty() => {
            format!("{} warning(s)", run.warnings.len())
        }
        RunStatus::Succeeded => String::new(),
    }
}

fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => "just now".into(),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
