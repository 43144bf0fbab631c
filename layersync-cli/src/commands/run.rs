//! `layersync run`: update one layer, or every layer due today.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use layersync_core::{registry, schedule, LayerDef, LayerName, Settings};
use layersync_engine::{
    run_log, ActionOutcome, Collaborators, FileStore, LayerRunOutcome, OrchestratorError,
    PlanarEngine, RemoteMirror, RunRecord, SqlApiMirror, SyncOrchestrator, ZipArchiveStore,
};

use super::{day_of_month, home_dir, load_settings};

/// Arguments for `layersync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Name of the layer to update (omit when using `--due`).
    pub layer: Option<String>,

    /// Update every layer scheduled for today, continuing past failures.
    #[arg(long, conflicts_with = "layer")]
    pub due: bool,

    /// Day of the month used by `--due` instead of today.
    #[arg(long, requires = "due", value_parser = clap::value_parser!(u32).range(1..=31))]
    pub day: Option<u32>,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let settings = load_settings(&home)?;

        let layers = if self.due {
            let day = day_of_month(self.day);
            let due: Vec<LayerDef> = registry::list_layers_at(&home)
                .context("failed to load layer definitions")?
                .into_iter()
                .filter(|def| schedule::is_due(def.update_days.as_ref(), day))
                .collect();
            if due.is_empty() {
                println!("No layers due on day {day}.");
                return Ok(());
            }
            due
        } else {
            let name = self
                .layer
                .clone()
                .context("provide a layer name or use --due")?;
            vec![registry::load_layer_at(&home, &LayerName::from(name.as_str()))
                .with_context(|| format!("failed to load layer '{name}'"))?]
        };

        let failed = run_layers(&home, &settings, &layers)?;
        if failed > 0 {
            bail!("{failed} of {} layer run(s) failed", layers.len());
        }
        Ok(())
    }
}

/// Run each layer in order and record its outcome. Returns how many failed.
fn run_layers(home: &Path, settings: &Settings, layers: &[LayerDef]) -> Result<usize> {
    let store = FileStore::open(&settings.store_root).with_context(|| {
        format!(
            "failed to open store at {}; run `layersync store init` first",
            settings.store_root.display()
        )
    })?;
    let archive = ZipArchiveStore::from_settings(settings);
    let mirror = settings
        .mirror
        .as_ref()
        .map(SqlApiMirror::from_settings)
        .transpose()
        .context("failed to configure the remote mirror")?;
    let orchestrator = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: mirror.as_ref().map(|m| m as &dyn RemoteMirror),
    });

    let mut failed = 0;
    for def in layers {
        let started = Utc::now();
        let result = orchestrator.run_layer_from_source(def, &def.scratch_dir(settings), started);
        let record = RunRecord::from_result(&def.name, started, Utc::now(), &result);
        run_log::save_at(home, &record)
            .with_context(|| format!("failed to record run of '{}'", def.name))?;

        match &result {
            Ok(outcome) => print_outcome(&def.name, outcome),
            Err(e) => {
                failed += 1;
                print_failure(&def.name, e);
            }
        }
    }
    Ok(failed)
}

fn print_outcome(layer: &LayerName, outcome: &LayerRunOutcome) {
    let sync = &outcome.sync;
    let mark = if outcome.propagation.has_failures() {
        "!".yellow()
    } else {
        "✓".green()
    };
    println!(
        "{mark} '{layer}' updated ({} deleted, {} appended, {} rows now)",
        sync.deleted_count, sync.appended_count, sync.post_count
    );

    let report = &outcome.propagation;
    for (action, result) in [
        ("raster", &report.raster),
        ("archive", &report.archive),
        ("mirror", &report.mirror),
    ] {
        let (label, text) = match result {
            ActionOutcome::Completed { detail } => (result.label().green(), detail),
            ActionOutcome::Skipped { reason } => (result.label().bright_black(), reason),
            ActionOutcome::Failed { error } => (result.label().red(), error),
        };
        println!("  {action:<8} {label:<9} {text}");
    }
    for warning in &outcome.warnings {
        println!("  {} {warning}", "warning:".yellow());
    }
}

fn print_failure(layer: &LayerName, error: &OrchestratorError) {
    eprintln!("{} '{layer}' stopped at {}: {error}", "✗".red(), error.stage());
}
