//! Propagation of a committed update to downstream consumers.
//!
//! Three independent actions run after a verified commit: raster
//! derivation, archive/download packaging and the remote mirror sync. A
//! failing action is recorded in the [`PropagationReport`] and never stops
//! its siblings or touches the committed data.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use layersync_core::{Dataset, DestinationId, LayerName, SpatialRef, UpdateWhereClause, VersionName};

use crate::archive::ArchiveStore;
use crate::context::OpContext;
use crate::error::PropagationError;
use crate::geo::GeoEngine;
use crate::mirror::RemoteMirror;
use crate::raster::{self, RasterTarget};
use crate::report::{ActionOutcome, PropagationReport, SyncResult, SyncWarning};
use crate::store::VersionedStore;

/// The external systems a layer run works against.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub store: &'a dyn VersionedStore,
    pub engine: &'a dyn GeoEngine,
    pub archive: &'a dyn ArchiveStore,
    /// Remote mirror client; mirror sync is skipped when absent.
    pub mirror: Option<&'a dyn RemoteMirror>,
}

/// What to propagate for one layer.
#[derive(Debug, Clone)]
pub struct PropagationPlan<'a> {
    pub layer: &'a LayerName,
    pub destination: &'a DestinationId,
    /// Filtered source in its native projection.
    pub source: &'a Dataset,
    pub merge_key_configured: bool,
    pub where_clause: Option<&'a UpdateWhereClause>,
    pub raster: Option<&'a RasterTarget>,
    pub mirror_table: Option<&'a str>,
    pub stamp: DateTime<Utc>,
}

pub struct PropagationCoordinator<'a> {
    deps: Collaborators<'a>,
    ctx: &'a OpContext,
}

/// Whether a native-projection download is packaged alongside the public one.
pub fn wants_local_copy(source: &Dataset, merge_key_configured: bool) -> bool {
    !source.spatial_ref.is_wgs84() && !merge_key_configured
}

impl<'a> PropagationCoordinator<'a> {
    /// Refuses a result whose row counts did not verify.
    pub fn new(
        committed: &SyncResult,
        deps: Collaborators<'a>,
        ctx: &'a OpContext,
    ) -> Result<Self, PropagationError> {
        if !committed.is_consistent() {
            return Err(PropagationError::NotCommitted(committed.destination.clone()));
        }
        Ok(Self { deps, ctx })
    }

    pub fn run(&self, plan: &PropagationPlan<'_>) -> PropagationReport {
        let committed = match self.deps.store.read(&VersionName::trunk(), plan.destination) {
            Ok(ds) => ds,
            Err(e) => {
                let e = PropagationError::Read(e);
                error!(layer = %plan.layer, error = %e, "cannot propagate");
                let failed = || ActionOutcome::Failed {
                    error: e.to_string(),
                };
                return PropagationReport {
                    raster: failed(),
                    archive: failed(),
                    mirror: failed(),
                    artifacts: Vec::new(),
                    warnings: Vec::new(),
                };
            }
        };

        let raster = match plan.raster {
            None => ActionOutcome::Skipped {
                reason: "no raster target configured".into(),
            },
            Some(target) => settle(
                plan.layer,
                "raster",
                raster::derive(self.deps.engine, self.ctx, &committed, target)
                    .map(|files| format!("{} file(s) replaced at {}", files.len(), target.dir().display())),
            ),
        };

        let public = self.public_copy(committed).map_err(|e| e.to_string());
        let prepared = || {
            public
                .as_ref()
                .map_err(|e| PropagationError::PublicCopy(e.clone()))
        };
        let mut artifacts = Vec::new();
        let mut warnings = Vec::new();

        let archive = settle(
            plan.layer,
            "archive",
            prepared().and_then(|public| self.package(plan, public, &mut artifacts, &mut warnings)),
        );

        let mirror = match (plan.mirror_table, self.deps.mirror) {
            (None, _) => ActionOutcome::Skipped {
                reason: "no mirror table configured".into(),
            },
            (Some(_), None) => ActionOutcome::Skipped {
                reason: "no mirror connection configured".into(),
            },
            (Some(table), Some(mirror)) => settle(
                plan.layer,
                "mirror",
                prepared().and_then(|public| {
                    let receipt = mirror.sync(public, table, plan.where_clause)?;
                    Ok(format!("{} row(s) sent to {table}", receipt.inserted))
                }),
            ),
        };

        PropagationReport {
            raster,
            archive,
            mirror,
            artifacts,
            warnings,
        }
    }

    /// The committed dataset in WGS 84, the reference of public products.
    fn public_copy(&self, committed: Dataset) -> Result<Dataset, PropagationError> {
        if committed.spatial_ref.is_wgs84() {
            return Ok(committed);
        }
        Ok(self
            .deps
            .engine
            .project(self.ctx, &committed, &SpatialRef::wgs84())?)
    }

    fn package(
        &self,
        plan: &PropagationPlan<'_>,
        public: &Dataset,
        artifacts: &mut Vec<PathBuf>,
        warnings: &mut Vec<SyncWarning>,
    ) -> Result<String, PropagationError> {
        let archive = self.deps.archive;
        artifacts.push(archive.archive(plan.layer, public, plan.stamp)?);
        artifacts.push(archive.download(plan.layer, public)?);

        if wants_local_copy(plan.source, plan.merge_key_configured) {
            if plan.source.name != plan.layer.0 {
                let warning = SyncWarning::LocalCopyRenamed {
                    from: plan.source.name.clone(),
                    to: plan.layer.0.clone(),
                };
                warn!(layer = %plan.layer, "{warning}");
                warnings.push(warning);
            }
            artifacts.push(archive.download_local(plan.layer, plan.source)?);
        }
        Ok(format!("{} zip(s) written", artifacts.len()))
    }
}

fn settle(layer: &LayerName, action: &str, result: Result<String, PropagationError>) -> ActionOutcome {
    match result {
        Ok(detail) => {
            info!(layer = %layer, action, "{detail}");
            ActionOutcome::Completed { detail }
        }
        Err(e) => {
            error!(layer = %layer, action, error = %e, "propagation action failed");
            ActionOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SpatialRef::WEB_MERCATOR, false, true)]
    #[case(SpatialRef::WEB_MERCATOR, true, false)]
    #[case(SpatialRef::WGS84, false, false)]
    #[case(SpatialRef::WGS84, true, false)]
    fn local_copy_needs_native_projection_and_full_replace(
        #[case] wkid: u32,
        #[case] merge_key: bool,
        #[case] expected: bool,
    ) {
        let source = Dataset::new("sad", SpatialRef::from_wkid(wkid));
        assert_eq!(wants_local_copy(&source, merge_key), expected);
    }
}
