//! Source filtering into the scratch workspace.

use std::path::{Path, PathBuf};

use tracing::info;

use layersync_core::{geojson, Dataset, Predicate};

use crate::error::FilterError;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// No predicate configured; use the source as is.
    Unchanged,
    /// Matching rows were removed from a scratch copy written to `path`.
    Filtered {
        dataset: Dataset,
        path: PathBuf,
        removed: usize,
    },
}

impl FilterOutcome {
    /// The dataset later stages should use.
    pub fn into_dataset(self, source: Dataset) -> Dataset {
        match self {
            FilterOutcome::Unchanged => source,
            FilterOutcome::Filtered { dataset, .. } => dataset,
        }
    }
}

/// Drop rows matching `predicate` from a copy of `source` in `scratch`.
///
/// The copy is written to `<scratch>/<name>.geojson`; `source` is never
/// modified.
pub fn apply(
    source: &Dataset,
    predicate: Option<&Predicate>,
    scratch: &Path,
) -> Result<FilterOutcome, FilterError> {
    let Some(predicate) = predicate else {
        return Ok(FilterOutcome::Unchanged);
    };

    std::fs::create_dir_all(scratch).map_err(|source| FilterError::Workspace {
        path: scratch.to_path_buf(),
        source,
    })?;

    let mut dataset = source.clone();
    dataset.features.retain(|f| !predicate.matches(f));
    let removed = source.len() - dataset.len();

    let path = scratch.join(format!("{}.geojson", source.name));
    geojson::write_path(&path, &dataset)?;
    info!(
        dataset = %source.name,
        filter = %predicate,
        removed,
        kept = dataset.len(),
        "source filtered"
    );

    Ok(FilterOutcome::Filtered {
        dataset,
        path,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersync_core::{Coord, Feature, Geometry, SpatialRef};
    use tempfile::TempDir;

    fn source() -> Dataset {
        let mut ds = Dataset::new("fires", SpatialRef::wgs84());
        for (i, conf) in ["high", "low", "nominal", "low"].iter().enumerate() {
            ds.features.push(
                Feature::new(Geometry::Point(Coord::new(i as f64, 0.0))).with("confidence", *conf),
            );
        }
        ds
    }

    #[test]
    fn no_predicate_passes_through_without_copy() {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("scratch");
        assert_eq!(apply(&source(), None, &scratch).unwrap(), FilterOutcome::Unchanged);
        assert!(!scratch.exists());
    }

    #[test]
    fn matching_rows_are_removed_from_a_copy() {
        let tmp = TempDir::new().unwrap();
        let src = source();
        let pred = Predicate::parse("confidence = 'low'").unwrap();

        let FilterOutcome::Filtered {
            dataset,
            path,
            removed,
        } = apply(&src, Some(&pred), tmp.path()).unwrap()
        else {
            panic!("expected a filtered copy")
        };
        assert_eq!(removed, 2);
        assert_eq!(dataset.len(), 2);
        assert_eq!(src.len(), 4);
        assert_eq!(path, tmp.path().join("fires.geojson"));
        let on_disk = geojson::read_path(&path, &SpatialRef::wgs84()).unwrap();
        assert_eq!(on_disk.features, dataset.features);
    }

    #[test]
    fn filtering_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pred = Predicate::parse("confidence IN ('low', 'nominal')").unwrap();
        let once = apply(&source(), Some(&pred), tmp.path())
            .unwrap()
            .into_dataset(source());
        let twice = apply(&once, Some(&pred), tmp.path())
            .unwrap()
            .into_dataset(once.clone());
        assert_eq!(once.features, twice.features);
        assert_eq!(twice.len(), 1);
    }
}
