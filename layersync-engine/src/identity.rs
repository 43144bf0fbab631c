//! Content-derived feature identities.
//!
//! Every feature carries a `gfwid`: the lowercase hex SHA-256 of its
//! repaired geometry's canonical WKT. Identical geometries always get the
//! same identity, so re-running an update reproduces the same keys.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use layersync_core::{Dataset, FieldDef, Geometry};

use crate::geo::GeoEngine;

pub const IDENTITY_FIELD: &str = "gfwid";
pub const IDENTITY_ALIAS: &str = "GFW ID";
/// Length of a hex SHA-256 digest.
pub const IDENTITY_LENGTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureIdentity(pub String);

impl std::fmt::Display for FeatureIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Geometries changed by repair.
    pub repaired: usize,
    /// Features dropped for a missing or unrepairable geometry.
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityReport {
    pub field_added: bool,
    pub repair: RepairReport,
    pub assigned: usize,
}

/// Add the identity column unless present. Safe to call repeatedly.
pub fn ensure_identity_field(dataset: &mut Dataset) -> bool {
    dataset.ensure_field(FieldDef::text(IDENTITY_FIELD, IDENTITY_LENGTH).with_alias(IDENTITY_ALIAS))
}

/// Replace each geometry by its repaired form, dropping features with
/// nothing left to repair.
pub fn repair_geometries(dataset: &mut Dataset, engine: &dyn GeoEngine) -> RepairReport {
    let mut report = RepairReport::default();
    dataset.features.retain_mut(|feature| {
        let Some(geometry) = &feature.geometry else {
            report.removed += 1;
            return false;
        };
        match engine.repair(geometry) {
            Some(fixed) => {
                if &fixed != geometry {
                    report.repaired += 1;
                    feature.geometry = Some(fixed);
                }
                true
            }
            None => {
                report.removed += 1;
                false
            }
        }
    });
    report
}

pub fn identity_of(geometry: &Geometry) -> FeatureIdentity {
    let mut hasher = Sha256::new();
    hasher.update(geometry.to_wkt().as_bytes());
    FeatureIdentity(hex::encode(hasher.finalize()))
}

/// Ensure the field, repair geometries, then populate `gfwid`.
pub fn assign(dataset: &mut Dataset, engine: &dyn GeoEngine) -> IdentityReport {
    let field_added = ensure_identity_field(dataset);
    let repair = repair_geometries(dataset, engine);
    if repair.removed > 0 {
        info!(
            dataset = %dataset.name,
            removed = repair.removed,
            "dropped features without a valid geometry"
        );
    }

    let mut assigned = 0;
    for feature in &mut dataset.features {
        if let Some(geometry) = &feature.geometry {
            let id = identity_of(geometry);
            feature.set(IDENTITY_FIELD, id.0);
            assigned += 1;
        }
    }
    debug!(dataset = %dataset.name, assigned, repaired = repair.repaired, "identities assigned");

    IdentityReport {
        field_added,
        repair,
        assigned,
    }
}
