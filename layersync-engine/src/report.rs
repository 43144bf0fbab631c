//! Results reported by a layer run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use layersync_core::{DestinationId, VersionName};

/// A non-fatal condition recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncWarning {
    /// Source and destination references differ but no transformation is
    /// configured; the projection ran without one.
    MissingTransformation { from: u32, to: u32 },
    /// The native-projection copy did not carry the layer's name and was
    /// renamed before packaging.
    LocalCopyRenamed { from: String, to: String },
    /// The session's version was already gone at cleanup.
    VersionAlreadyAbsent { version: VersionName },
}

impl std::fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncWarning::MissingTransformation { from, to } => {
                write!(f, "no transformation configured for {from} -> {to}")
            }
            SyncWarning::LocalCopyRenamed { from, to } => {
                write!(f, "local projection copy renamed from '{from}' to '{to}'")
            }
            SyncWarning::VersionAlreadyAbsent { version } => {
                write!(f, "version '{version}' was already deleted")
            }
        }
    }
}

/// Row counts of one delete-then-append update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub destination: DestinationId,
    pub version: VersionName,
    /// Rows visible in the version before the delete.
    pub initial_count: u64,
    pub deleted_count: u64,
    /// Rows visible in the version after the delete, before the append.
    pub pre_count: u64,
    pub appended_count: u64,
    /// Trunk rows after reconcile and post.
    pub post_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SyncWarning>,
}

impl SyncResult {
    pub fn is_consistent(&self) -> bool {
        self.pre_count + self.appended_count == self.post_count
    }
}

/// Outcome of one propagation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed { detail: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl ActionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ActionOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionOutcome::Completed { .. } => "completed",
            ActionOutcome::Skipped { .. } => "skipped",
            ActionOutcome::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionOutcome::Completed { detail } => write!(f, "completed: {detail}"),
            ActionOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            ActionOutcome::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub raster: ActionOutcome,
    pub archive: ActionOutcome,
    pub mirror: ActionOutcome,
    /// Files written by the archive action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SyncWarning>,
}

impl PropagationReport {
    pub fn has_failures(&self) -> bool {
        self.raster.is_failed() || self.archive.is_failed() || self.mirror.is_failed()
    }
}

/// Everything a successful layer run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRunOutcome {
    pub sync: SyncResult,
    pub propagation: PropagationReport,
    pub warnings: Vec<SyncWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(pre: u64, appended: u64, post: u64) -> SyncResult {
        SyncResult {
            destination: DestinationId::from("d"),
            version: VersionName::from("v"),
            initial_count: pre,
            deleted_count: 0,
            pre_count: pre,
            appended_count: appended,
            post_count: post,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn consistency_is_row_conservation() {
        assert!(result(70, 100, 170).is_consistent());
        assert!(!result(70, 100, 169).is_consistent());
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let json = serde_json::to_value(ActionOutcome::Skipped {
            reason: "no raster configured".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "no raster configured");
    }
}
