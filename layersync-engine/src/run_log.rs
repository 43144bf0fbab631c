//! Run log: the latest run of each layer.
//!
//! Persists one `RunRecord` JSON document per layer at
//! `<home>/.layersync/runs/<layer>.json`, written with the same atomic
//! `.tmp` + rename pattern as the registry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layersync_core::LayerName;

use crate::error::{run_log_io, OrchestratorError, RunLogError, Stage};
use crate::report::{LayerRunOutcome, PropagationReport, SyncResult, SyncWarning};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Committed, but at least one propagation action failed.
    PropagationFailed,
    Failed { stage: Stage, error: String },
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PropagationFailed => "propagation failed",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub layer: LayerName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SyncWarning>,
}

impl RunRecord {
    pub fn from_result(
        layer: &LayerName,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        result: &Result<LayerRunOutcome, OrchestratorError>,
    ) -> Self {
        let (status, sync, propagation, warnings) = match result {
            Ok(outcome) => {
                let status = if outcome.propagation.has_failures() {
                    RunStatus::PropagationFailed
                } else {
                    RunStatus::Succeeded
                };
                (
                    status,
                    Some(outcome.sync.clone()),
                    Some(outcome.propagation.clone()),
                    outcome.warnings.clone(),
                )
            }
            Err(e) => (
                RunStatus::Failed {
                    stage: e.stage(),
                    error: e.to_string(),
                },
                None,
                None,
                Vec::new(),
            ),
        };
        Self {
            layer: layer.clone(),
            started_at,
            finished_at,
            status,
            sync,
            propagation,
            warnings,
        }
    }
}

/// `~/.layersync/runs/<layer>.json`
pub fn record_path_at(home: &Path, layer: &LayerName) -> PathBuf {
    home.join(".layersync")
        .join("runs")
        .join(format!("{layer}.json"))
}

/// Latest record for `layer`, or `None` if it never ran.
pub fn load_at(home: &Path, layer: &LayerName) -> Result<Option<RunRecord>, RunLogError> {
    let path = record_path_at(home, layer);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| run_log_io(&path, e))?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Save `record` atomically, replacing the previous record of its layer.
pub fn save_at(home: &Path, record: &RunRecord) -> Result<(), RunLogError> {
    let path = record_path_at(home, &record.layer);
    let Some(dir) = path.parent() else {
        return Err(run_log_io(
            path,
            std::io::Error::other("invalid run log path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| run_log_io(dir, e))?;

    let json = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| run_log_io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| run_log_io(&path, e))?;
    Ok(())
}
