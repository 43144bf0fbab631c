//! Layer definitions and global settings, persisted as YAML.
//!
//! # Storage layout
//!
//! ```text
//! ~/.layersync/
//!   settings.yaml         (store / archive / download / scratch roots)
//!   layers/
//!     <layer>.yaml        (one LayerDef per file: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::predicate::Predicate;
use crate::schedule::UpdateDays;
use crate::types::{DestinationId, LayerName, SpatialRef};

/// Raster sidecar extensions written alongside a GeoTIFF.
pub const DEFAULT_RASTER_SIDECARS: [&str; 6] = [
    ".tif",
    ".tfw",
    ".tif.aux.xml",
    ".tif.vat.cpg",
    ".tif.vat.dbf",
    ".tif.xml",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Connection details for the remote tabular mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSettings {
    /// SQL API endpoint, e.g. `https://<account>.carto.com/api/v2/sql`.
    pub endpoint: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_api_key_env() -> String {
    "LAYERSYNC_MIRROR_API_KEY".to_owned()
}

/// Installation-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory of the file-backed versioned store.
    pub store_root: PathBuf,
    /// Timestamped archive zips land here (`src/` holds source snapshots).
    pub archive_dir: PathBuf,
    /// Public download zips land here.
    pub download_dir: PathBuf,
    /// Parent of per-layer scratch workspaces.
    pub scratch_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorSettings>,
}

/// Optional raster derived from the committed vector layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterTargetDef {
    /// Path of the primary raster file being replaced.
    pub path: PathBuf,
    /// Spatial reference of the raster.
    pub wkid: u32,
    /// Extensions of the file set sharing the raster's basename.
    #[serde(default = "default_sidecars")]
    pub sidecars: Vec<String>,
}

fn default_sidecars() -> Vec<String> {
    DEFAULT_RASTER_SIDECARS.iter().map(|s| (*s).to_owned()).collect()
}

fn default_source_wkid() -> u32 {
    SpatialRef::WGS84
}

/// Per-layer update definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    pub name: LayerName,
    /// Source GeoJSON file.
    pub source: PathBuf,
    /// Spatial reference assumed when the source carries no `crs`.
    #[serde(default = "default_source_wkid")]
    pub source_wkid: u32,
    /// Destination dataset in the versioned store.
    pub destination: DestinationId,
    /// Remote mirror table; no mirror sync when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_table: Option<String>,
    /// Rows of the source matching this predicate are dropped before the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
    /// Field whose distinct source values scope the delete-then-append.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_key: Option<String>,
    /// Geographic transformation used when projecting source → destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<String>,
    /// Constant written to a `country` column on every feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster: Option<RasterTargetDef>,
    /// Overrides `<scratch_root>/<layer>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_workspace: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_days: Option<UpdateDays>,
}

impl LayerDef {
    /// Minimal definition: everything optional left unset.
    pub fn new(name: impl Into<LayerName>, source: PathBuf, destination: impl Into<DestinationId>) -> Self {
        Self {
            name: name.into(),
            source,
            source_wkid: default_source_wkid(),
            destination: destination.into(),
            mirror_table: None,
            filter: None,
            merge_key: None,
            transformation: None,
            country_code: None,
            raster: None,
            scratch_workspace: None,
            update_days: None,
        }
    }

    /// Scratch workspace for this layer.
    pub fn scratch_dir(&self, settings: &Settings) -> PathBuf {
        self.scratch_workspace
            .clone()
            .unwrap_or_else(|| settings.scratch_root.join(&self.name.0))
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidLayer {
            layer: self.name.0.clone(),
            reason: reason.to_owned(),
        };

        let name = &self.name.0;
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("name may only contain ASCII letters, digits, '_' and '-'"));
        }
        if self.destination.0.trim().is_empty() {
            return Err(invalid("destination is empty"));
        }
        if let Some(code) = &self.country_code {
            if code.is_empty() || code.chars().count() > 3 {
                return Err(invalid("country_code must be 1-3 characters"));
            }
        }
        if let Some(key) = &self.merge_key {
            if key.trim().is_empty() {
                return Err(invalid("merge_key is empty; omit it to replace the whole destination"));
            }
        }
        if let Some(raster) = &self.raster {
            if raster.sidecars.is_empty() {
                return Err(invalid("raster.sidecars must list at least the primary extension"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.layersync`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".layersync")
}

/// `<home>/.layersync/settings.yaml`: pure, no I/O.
pub fn settings_path_at(home: &Path) -> PathBuf {
    root_at(home).join("settings.yaml")
}

/// `<home>/.layersync/layers/`
pub fn layers_dir_at(home: &Path) -> PathBuf {
    root_at(home).join("layers")
}

/// `<home>/.layersync/layers/<layer>.yaml`: pure, no I/O.
pub fn layer_path_at(home: &Path, layer: &LayerName) -> PathBuf {
    layers_dir_at(home).join(format!("{}.yaml", layer.0))
}

// ---------------------------------------------------------------------------
// 2. Settings
// ---------------------------------------------------------------------------

/// Load `settings.yaml`.
pub fn load_settings_at(home: &Path) -> Result<Settings, RegistryError> {
    let path = settings_path_at(home);
    if !path.exists() {
        return Err(RegistryError::SettingsNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_settings_at` convenience wrapper.
pub fn load_settings() -> Result<Settings, RegistryError> {
    load_settings_at(&home()?)
}

/// Atomically save `settings.yaml`.
pub fn save_settings_at(home: &Path, settings: &Settings) -> Result<(), RegistryError> {
    let path = settings_path_at(home);
    write_yaml_atomic(&path, &serde_yaml::to_string(settings)?)
}

// ---------------------------------------------------------------------------
// 3. Layers
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.layersync/layers/<layer>.yaml`.
///
/// Returns `RegistryError::LayerNotFound` if absent,
/// `RegistryError::Parse` (with path + line context) if malformed YAML.
pub fn load_layer_at(home: &Path, layer: &LayerName) -> Result<LayerDef, RegistryError> {
    let path = layer_path_at(home, layer);
    if !path.exists() {
        return Err(RegistryError::LayerNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let def: LayerDef =
        serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })?;
    def.validate()?;
    Ok(def)
}

/// `load_layer_at` convenience wrapper.
pub fn load_layer(layer: &LayerName) -> Result<LayerDef, RegistryError> {
    load_layer_at(&home()?, layer)
}

/// All layer definitions, sorted by name. Skips non-`.yaml` files.
pub fn list_layers_at(home: &Path) -> Result<Vec<LayerDef>, RegistryError> {
    let dir = layers_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut result = Vec::new();
    for entry in entries {
        let fname = entry.file_name();
        let Some(stem) = fname.to_string_lossy().strip_suffix(".yaml").map(str::to_owned) else {
            continue;
        };
        result.push(load_layer_at(home, &LayerName::from(stem))?);
    }
    Ok(result)
}

/// `list_layers_at` convenience wrapper.
pub fn list_layers() -> Result<Vec<LayerDef>, RegistryError> {
    list_layers_at(&home()?)
}

/// Validate and atomically save a layer definition.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_layer_at(home: &Path, def: &LayerDef) -> Result<(), RegistryError> {
    def.validate()?;
    let path = layer_path_at(home, &def.name);
    write_yaml_atomic(&path, &serde_yaml::to_string(def)?)
}

/// `save_layer_at` convenience wrapper.
pub fn save_layer(def: &LayerDef) -> Result<(), RegistryError> {
    save_layer_at(&home()?, def)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

fn write_yaml_atomic(path: &Path, yaml: &str) -> Result<(), RegistryError> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            set_dir_permissions(dir)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, yaml)?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn def() -> LayerDef {
        LayerDef::new("imazon_sad", PathBuf::from("/data/imazon_sad.geojson"), "gfw.imazon_sad")
    }

    #[test]
    fn layer_path_is_correct() {
        let home = make_home();
        let path = layer_path_at(home.path(), &LayerName::from("imazon_sad"));
        assert!(path.ends_with(".layersync/layers/imazon_sad.yaml"));
    }

    #[test]
    fn save_and_load_layer_roundtrip() {
        let home = make_home();
        let mut layer = def();
        layer.merge_key = Some("date".into());
        layer.filter = Some(Predicate::parse("area_ha < 6.25").unwrap());
        layer.country_code = Some("BRA".into());
        save_layer_at(home.path(), &layer).expect("save");
        let loaded = load_layer_at(home.path(), &layer.name).expect("load");
        assert_eq!(loaded, layer);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        save_layer_at(home.path(), &def()).expect("save");
        let tmp = layers_dir_at(home.path()).join("imazon_sad.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn layers_dir_created_with_perms() {
        let home = make_home();
        save_layer_at(home.path(), &def()).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(layers_dir_at(home.path()))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn sidecars_default_to_geotiff_set() {
        let yaml = "path: /rasters/forest.tif\nwkid: 4326\n";
        let raster: RasterTargetDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(raster.sidecars.len(), 6);
        assert_eq!(raster.sidecars[0], ".tif");
    }

    #[test]
    fn invalid_country_code_rejected() {
        let mut layer = def();
        layer.country_code = Some("BRAZ".into());
        let err = layer.validate().unwrap_err();
        assert!(err.to_string().contains("country_code"));
    }

    #[test]
    fn path_unsafe_name_rejected() {
        let mut layer = def();
        layer.name = LayerName::from("../etc");
        assert!(matches!(layer.validate(), Err(RegistryError::InvalidLayer { .. })));
    }

    #[test]
    fn list_layers_empty_when_no_dir() {
        let home = make_home();
        assert!(list_layers_at(home.path()).expect("list").is_empty());
    }

    #[test]
    fn scratch_dir_defaults_under_scratch_root() {
        let settings = Settings {
            store_root: "/store".into(),
            archive_dir: "/archive".into(),
            download_dir: "/download".into(),
            scratch_root: "/scratch".into(),
            mirror: None,
        };
        assert_eq!(def().scratch_dir(&settings), PathBuf::from("/scratch/imazon_sad"));
    }
}
