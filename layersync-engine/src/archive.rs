//! Zip packaging of source snapshots, archives and public downloads.
//!
//! Every zip holds a single `<layer>.geojson` member. Zips are written to
//! `<path>.tmp` and renamed into place.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use layersync_core::{geojson, Dataset, LayerName, Settings};

use crate::error::{archive_io, ArchiveError};

/// Timestamp format used in archive file names.
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

pub trait ArchiveStore {
    /// `<archive_dir>/src/<layer>_<stamp>.zip`, the raw source before filtering.
    fn snapshot_source(
        &self,
        layer: &LayerName,
        source: &Dataset,
        stamp: DateTime<Utc>,
    ) -> Result<PathBuf, ArchiveError>;

    /// `<archive_dir>/<layer>_<stamp>.zip`
    fn archive(
        &self,
        layer: &LayerName,
        dataset: &Dataset,
        stamp: DateTime<Utc>,
    ) -> Result<PathBuf, ArchiveError>;

    /// `<download_dir>/<layer>.zip`
    fn download(&self, layer: &LayerName, dataset: &Dataset) -> Result<PathBuf, ArchiveError>;

    /// `<download_dir>/<layer>_local.zip`, the dataset in its native projection.
    fn download_local(&self, layer: &LayerName, dataset: &Dataset) -> Result<PathBuf, ArchiveError>;
}

#[derive(Debug, Clone)]
pub struct ZipArchiveStore {
    archive_dir: PathBuf,
    download_dir: PathBuf,
}

impl ZipArchiveStore {
    pub fn new(archive_dir: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.archive_dir, &settings.download_dir)
    }
}

fn stamped(layer: &LayerName, stamp: DateTime<Utc>) -> String {
    format!("{}_{}.zip", layer, stamp.format(STAMP_FORMAT))
}

/// Write `dataset`, renamed to `layer`, as the only member of a zip at `path`.
fn write_zip(path: &Path, layer: &LayerName, dataset: &Dataset) -> Result<PathBuf, ArchiveError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| archive_io(parent, e))?;
    }

    let mut named = dataset.clone();
    named.name = layer.0.clone();
    let body = serde_json::to_vec(&geojson::to_geojson(&named))?;

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let zip_err = |source| ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::create(&tmp).map_err(|e| archive_io(&tmp, e))?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    zip.start_file(format!("{layer}.geojson"), options)
        .map_err(zip_err)?;
    zip.write_all(&body).map_err(|e| archive_io(&tmp, e))?;
    zip.finish().map_err(zip_err)?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(archive_io(path, e));
    }
    debug!(path = %path.display(), rows = dataset.len(), "zip written");
    Ok(path.to_path_buf())
}

impl ArchiveStore for ZipArchiveStore {
    fn snapshot_source(
        &self,
        layer: &LayerName,
        source: &Dataset,
        stamp: DateTime<Utc>,
    ) -> Result<PathBuf, ArchiveError> {
        let path = self.archive_dir.join("src").join(stamped(layer, stamp));
        write_zip(&path, layer, source)
    }

    fn archive(
        &self,
        layer: &LayerName,
        dataset: &Dataset,
        stamp: DateTime<Utc>,
    ) -> Result<PathBuf, ArchiveError> {
        write_zip(&self.archive_dir.join(stamped(layer, stamp)), layer, dataset)
    }

    fn download(&self, layer: &LayerName, dataset: &Dataset) -> Result<PathBuf, ArchiveError> {
        write_zip(&self.download_dir.join(format!("{layer}.zip")), layer, dataset)
    }

    fn download_local(&self, layer: &LayerName, dataset: &Dataset) -> Result<PathBuf, ArchiveError> {
        write_zip(&self.download_dir.join(format!("{layer}_local.zip")), layer, dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use layersync_core::{Coord, Feature, Geometry, SpatialRef};
    use std::io::Read;
    use tempfile::TempDir;

    fn dataset() -> Dataset {
        let mut ds = Dataset::new("scratch_copy", SpatialRef::from_wkid(3857));
        ds.features
            .push(Feature::new(Geometry::Point(Coord::new(1.0, 2.0))).with("state", "PA"));
        ds
    }

    fn member(path: &Path, name: &str) -> serde_json::Value {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut body = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut body).unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[test]
    fn paths_follow_layer_and_stamp() {
        let tmp = TempDir::new().unwrap();
        let store = ZipArchiveStore::new(tmp.path().join("archive"), tmp.path().join("download"));
        let layer = LayerName::from("imazon_sad");
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap();

        assert_eq!(
            store.snapshot_source(&layer, &dataset(), stamp).unwrap(),
            tmp.path().join("archive/src/imazon_sad_20240301063000.zip")
        );
        assert_eq!(
            store.archive(&layer, &dataset(), stamp).unwrap(),
            tmp.path().join("archive/imazon_sad_20240301063000.zip")
        );
        assert_eq!(
            store.download(&layer, &dataset()).unwrap(),
            tmp.path().join("download/imazon_sad.zip")
        );
        assert_eq!(
            store.download_local(&layer, &dataset()).unwrap(),
            tmp.path().join("download/imazon_sad_local.zip")
        );
        assert!(!tmp.path().join("download/imazon_sad.zip.tmp").exists());
    }

    #[test]
    fn member_is_named_after_the_layer() {
        let tmp = TempDir::new().unwrap();
        let store = ZipArchiveStore::new(tmp.path(), tmp.path());
        let path = store
            .download_local(&LayerName::from("imazon_sad"), &dataset())
            .unwrap();
        let doc = member(&path, "imazon_sad.geojson");
        assert_eq!(doc["name"], "imazon_sad");
        assert_eq!(doc["crs"]["properties"]["name"], "urn:ogc:def:crs:EPSG::3857");
        assert_eq!(doc["features"][0]["properties"]["state"], "PA");
    }
}
