//! Per-layer update pipeline.
//!
//! ```text
//! read source → archive source → filter → assign identities → tag
//!   → build where clause → edit session → raster / archive / mirror
//! ```
//!
//! Every stage before propagation is fatal: its error stops the run and
//! nothing later executes. Stages that already committed are not rolled
//! back. Propagation failures are reported, not raised.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use layersync_core::{geojson, Dataset, FieldDef, LayerDef, SpatialRef, UpdateWhereClause, Value};

use crate::context::OpContext;
use crate::error::{OrchestratorError, Stage};
use crate::filter;
use crate::identity;
use crate::propagate::{Collaborators, PropagationCoordinator, PropagationPlan};
use crate::raster::RasterTarget;
use crate::report::LayerRunOutcome;
use crate::session;

pub const COUNTRY_FIELD: &str = "country";
pub const COUNTRY_LENGTH: u32 = 3;

/// Ensure a `country` column and set it to `code` on every feature.
pub fn tag_country(dataset: &mut Dataset, code: &str) -> bool {
    let added = dataset.ensure_field(FieldDef::text(COUNTRY_FIELD, COUNTRY_LENGTH));
    dataset.fill(COUNTRY_FIELD, &Value::from(code));
    added
}

/// Read a layer's source GeoJSON, defaulting to its configured wkid.
pub fn read_source(def: &LayerDef) -> Result<Dataset, OrchestratorError> {
    geojson::read_path(&def.source, &SpatialRef::from_wkid(def.source_wkid)).map_err(|source| {
        OrchestratorError::Source {
            stage: Stage::ReadSource,
            source,
        }
    })
}

pub struct SyncOrchestrator<'a> {
    deps: Collaborators<'a>,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(deps: Collaborators<'a>) -> Self {
        Self { deps }
    }

    /// Read the layer's source file, then [`SyncOrchestrator::run_layer`].
    pub fn run_layer_from_source(
        &self,
        def: &LayerDef,
        scratch: &Path,
        started_at: DateTime<Utc>,
    ) -> Result<LayerRunOutcome, OrchestratorError> {
        info!(layer = %def.name, stage = %Stage::ReadSource, source = %def.source.display());
        let source = read_source(def)?;
        self.run_layer(def, scratch, source, started_at)
    }

    pub fn run_layer(
        &self,
        def: &LayerDef,
        scratch: &Path,
        source: Dataset,
        started_at: DateTime<Utc>,
    ) -> Result<LayerRunOutcome, OrchestratorError> {
        let layer = &def.name;
        let ctx = OpContext::new(layer.clone(), scratch).with_transformation(def.transformation.clone());

        info!(layer = %layer, stage = %Stage::ArchiveSource, rows = source.len());
        self.deps
            .archive
            .snapshot_source(layer, &source, started_at)
            .map_err(|source| OrchestratorError::Archive {
                stage: Stage::ArchiveSource,
                source,
            })?;

        info!(layer = %layer, stage = %Stage::FilterSource);
        let mut working = filter::apply(&source, def.filter.as_ref(), scratch)
            .map_err(|source| OrchestratorError::Filter {
                stage: Stage::FilterSource,
                source,
            })?
            .into_dataset(source);

        info!(layer = %layer, stage = %Stage::AssignIdentity);
        let ids = identity::assign(&mut working, self.deps.engine);
        info!(layer = %layer, assigned = ids.assigned, removed = ids.repair.removed, "identities assigned");

        if let Some(code) = &def.country_code {
            info!(layer = %layer, stage = %Stage::TagAttributes, country = %code);
            tag_country(&mut working, code);
        }

        info!(layer = %layer, stage = %Stage::BuildWhereClause);
        let clause = UpdateWhereClause::build(&working, def.merge_key.as_deref()).map_err(|source| {
            OrchestratorError::WhereClause {
                stage: Stage::BuildWhereClause,
                source,
            }
        })?;

        info!(layer = %layer, stage = %Stage::EditSession, destination = %def.destination);
        let sync = session::run(
            self.deps.store,
            self.deps.engine,
            &ctx,
            &def.destination,
            &working,
            clause.as_ref(),
            started_at,
        )
        .map_err(|source| OrchestratorError::Session {
            stage: Stage::EditSession,
            source,
        })?;

        let coordinator = PropagationCoordinator::new(&sync, self.deps, &ctx).map_err(|e| {
            OrchestratorError::Invalid {
                stage: Stage::EditSession,
                reason: e.to_string(),
            }
        })?;
        let raster = def.raster.as_ref().map(RasterTarget::from);
        let propagation = coordinator.run(&PropagationPlan {
            layer,
            destination: &def.destination,
            source: &working,
            merge_key_configured: def.merge_key.is_some(),
            where_clause: clause.as_ref(),
            raster: raster.as_ref(),
            mirror_table: def.mirror_table.as_deref(),
            stamp: started_at,
        });

        let warnings = sync
            .warnings
            .iter()
            .chain(&propagation.warnings)
            .cloned()
            .collect();
        info!(
            layer = %layer,
            post_count = sync.post_count,
            propagation_failures = propagation.has_failures(),
            "layer run finished"
        );
        Ok(LayerRunOutcome {
            sync,
            propagation,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersync_core::{Coord, Feature, Geometry};

    #[test]
    fn country_tagging_is_idempotent() {
        let mut ds = Dataset::new("sad", SpatialRef::wgs84());
        ds.features.push(Feature::new(Geometry::Point(Coord::new(0.0, 0.0))));
        assert!(tag_country(&mut ds, "BRA"));
        assert!(!tag_country(&mut ds, "BRA"));
        assert_eq!(ds.fields.len(), 1);
        assert_eq!(ds.features[0].get(COUNTRY_FIELD), &Value::from("BRA"));
    }

    #[test]
    fn unreadable_source_fails_at_read_stage() {
        let def = LayerDef::new("sad", "/nonexistent/sad.geojson".into(), "gfw.sad");
        let err = read_source(&def).unwrap_err();
        assert_eq!(err.stage(), Stage::ReadSource);
    }
}
