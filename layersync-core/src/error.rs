//! Error types for layersync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from layer registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.layersync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// No layer definition at the expected path.
    #[error("layer definition not found at {path}")]
    LayerNotFound { path: PathBuf },

    /// No settings file at the expected path.
    #[error("settings not found at {path}")]
    SettingsNotFound { path: PathBuf },

    /// The layer definition parsed but is not usable.
    #[error("invalid layer '{layer}': {reason}")]
    InvalidLayer { layer: String, reason: String },
}

/// Errors raised while parsing an attribute predicate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredicateError {
    /// Empty or whitespace-only expression.
    #[error("predicate is empty")]
    Empty,

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("expected {expected}, found {found}")]
    Unexpected { expected: &'static str, found: String },

    #[error("trailing input after expression: {found}")]
    Trailing { found: String },
}

/// Errors raised while building an update where clause.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WhereClauseError {
    #[error("merge key field '{field}' not found in dataset '{dataset}'")]
    MissingField { field: String, dataset: String },

    #[error("merge key field '{field}' holds a number that is not an exact integer ({value}); only text, integer and boolean keys are supported")]
    UnsupportedKey { field: String, value: f64 },
}

/// Errors raised while decoding or writing GeoJSON.
#[derive(Debug, Error)]
pub enum GeoJsonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("GeoJSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid GeoJSON: {0}")]
    Invalid(String),
}

/// Convenience constructor for [`GeoJsonError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> GeoJsonError {
    GeoJsonError::Io {
        path: path.into(),
        source,
    }
}
