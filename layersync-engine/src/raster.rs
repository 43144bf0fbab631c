//! Raster derivation from a committed vector layer.
//!
//! A raster target is a file set sharing one basename: the primary raster
//! plus its sidecars (`loss.tif`, `loss.tfw`, `loss.tif.aux.xml`, ...). The
//! new set is rendered into a fresh directory under the scratch workspace
//! and then replaces the old set: every existing member is deleted before
//! the new members are moved in.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use layersync_core::{Dataset, FieldDef, FieldKind, RasterTargetDef, SpatialRef, Value};

use crate::context::OpContext;
use crate::error::{propagation_io, PropagationError};
use crate::geo::GeoEngine;

/// Constant burned into every cell covered by a feature.
pub const BURN_FIELD: &str = "ras_val";
pub const BURN_VALUE: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterTarget {
    pub path: PathBuf,
    pub spatial_ref: SpatialRef,
    /// Extensions of the file set; the first is the primary raster.
    pub sidecars: Vec<String>,
}

impl From<&RasterTargetDef> for RasterTarget {
    fn from(def: &RasterTargetDef) -> Self {
        Self {
            path: def.path.clone(),
            spatial_ref: SpatialRef::from_wkid(def.wkid),
            sidecars: def.sidecars.clone(),
        }
    }
}

impl RasterTarget {
    fn primary_ext(&self) -> &str {
        self.sidecars.first().map_or("", String::as_str)
    }

    /// File name without the primary extension.
    pub fn basename(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.strip_suffix(self.primary_ext()) {
            Some(stem) if !stem.is_empty() && !self.primary_ext().is_empty() => stem.to_owned(),
            _ => self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or(name),
        }
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Render `dataset` onto the target's grid and replace the target file set.
pub fn derive(
    engine: &dyn GeoEngine,
    ctx: &OpContext,
    dataset: &Dataset,
    target: &RasterTarget,
) -> Result<Vec<PathBuf>, PropagationError> {
    let grid = engine.describe_raster(&target.path, &target.spatial_ref)?;
    let mut burn = engine.project(ctx, dataset, &target.spatial_ref)?;
    burn.ensure_field(FieldDef {
        name: BURN_FIELD.to_owned(),
        kind: FieldKind::Integer,
        alias: None,
    });
    burn.fill(BURN_FIELD, &Value::Int(BURN_VALUE));

    let basename = target.basename();
    let staging = ctx.workspace.join(format!("raster_{basename}"));
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| propagation_io(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| propagation_io(&staging, e))?;

    let written = engine.rasterize(ctx, &burn, BURN_FIELD, &grid, &staging, &basename)?;
    debug!(layer = %ctx.layer, files = written.len(), "raster rendered");

    let moved = replace_file_set(&staging, target.dir(), &basename, &target.sidecars)?;
    let _ = std::fs::remove_dir_all(&staging);
    info!(layer = %ctx.layer, raster = %target.path.display(), files = moved.len(), "raster replaced");
    Ok(moved)
}

/// Replace `<to_dir>/<basename><ext>` for every `ext` in `sidecars` with
/// the files of the same name in `from_dir`.
///
/// Nothing is deleted unless the new primary file exists.
pub fn replace_file_set(
    from_dir: &Path,
    to_dir: &Path,
    basename: &str,
    sidecars: &[String],
) -> Result<Vec<PathBuf>, PropagationError> {
    let Some(primary) = sidecars.first() else {
        return Err(PropagationError::FileSet("no extensions configured".into()));
    };
    let new_primary = from_dir.join(format!("{basename}{primary}"));
    if !new_primary.is_file() {
        return Err(PropagationError::FileSet(format!(
            "engine did not produce {}",
            new_primary.display()
        )));
    }

    for ext in sidecars {
        let old = to_dir.join(format!("{basename}{ext}"));
        if old.exists() {
            std::fs::remove_file(&old).map_err(|e| propagation_io(&old, e))?;
        }
    }

    std::fs::create_dir_all(to_dir).map_err(|e| propagation_io(to_dir, e))?;
    let mut moved = Vec::new();
    for ext in sidecars {
        let src = from_dir.join(format!("{basename}{ext}"));
        if !src.exists() {
            continue;
        }
        let dst = to_dir.join(format!("{basename}{ext}"));
        if std::fs::rename(&src, &dst).is_err() {
            std::fs::copy(&src, &dst).map_err(|e| propagation_io(&dst, e))?;
            std::fs::remove_file(&src).map_err(|e| propagation_io(&src, e))?;
        }
        moved.push(dst);
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn basename_strips_the_primary_extension() {
        let target = RasterTarget {
            path: PathBuf::from("/data/loss.tif"),
            spatial_ref: SpatialRef::wgs84(),
            sidecars: exts(&[".tif", ".tfw"]),
        };
        assert_eq!(target.basename(), "loss");
        assert_eq!(target.dir(), Path::new("/data"));
    }

    #[test]
    fn replace_deletes_stale_sidecars_and_moves_new_set() {
        let tmp = TempDir::new().unwrap();
        let (from, to) = (tmp.path().join("new"), tmp.path().join("live"));
        std::fs::create_dir_all(&from).unwrap();
        std::fs::create_dir_all(&to).unwrap();
        std::fs::write(to.join("loss.tif"), "old").unwrap();
        std::fs::write(to.join("loss.tif.xml"), "old metadata").unwrap();
        std::fs::write(from.join("loss.tif"), "new").unwrap();
        std::fs::write(from.join("loss.tfw"), "world").unwrap();

        let sidecars = exts(&[".tif", ".tfw", ".tif.xml"]);
        let moved = replace_file_set(&from, &to, "loss", &sidecars).unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(std::fs::read_to_string(to.join("loss.tif")).unwrap(), "new");
        assert!(to.join("loss.tfw").exists());
        assert!(!to.join("loss.tif.xml").exists());
        assert!(!from.join("loss.tif").exists());
    }

    #[test]
    fn missing_primary_leaves_the_live_set_alone() {
        let tmp = TempDir::new().unwrap();
        let (from, to) = (tmp.path().join("new"), tmp.path().join("live"));
        std::fs::create_dir_all(&from).unwrap();
        std::fs::create_dir_all(&to).unwrap();
        std::fs::write(to.join("loss.tif"), "old").unwrap();

        let err = replace_file_set(&from, &to, "loss", &exts(&[".tif"])).unwrap_err();
        assert!(matches!(err, PropagationError::FileSet(_)));
        assert_eq!(std::fs::read_to_string(to.join("loss.tif")).unwrap(), "old");
    }
}
