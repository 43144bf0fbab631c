//! Error types for layersync-engine.

use std::path::PathBuf;

use thiserror::Error;

use layersync_core::{DestinationId, GeoJsonError, SpatialRef, VersionName, WhereClauseError};

use crate::session::SessionState;

/// Errors raised by a [`crate::store::VersionedStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store root is missing or not a directory.
    #[error("invalid store workspace {path}: {reason}")]
    InvalidWorkspace { path: PathBuf, reason: String },

    #[error("destination '{0}' not found")]
    DestinationNotFound(DestinationId),

    #[error("destination '{0}' already exists")]
    DestinationExists(DestinationId),

    #[error("version '{0}' not found")]
    VersionNotFound(VersionName),

    #[error("version '{0}' already exists")]
    VersionExists(VersionName),

    #[error("the trunk version cannot be {0}")]
    TrunkProtected(&'static str),

    #[error("versions can only be created from and reconciled into the trunk, not '{0}'")]
    UnsupportedParent(VersionName),

    #[error("unsupported reconcile policy: {0}")]
    UnsupportedPolicy(&'static str),

    #[error("reconcile of '{version}' aborted on {conflicts} conflict(s)")]
    Conflicts { version: VersionName, conflicts: usize },

    #[error("field '{field}' is not in the schema of '{destination}'")]
    SchemaMismatch {
        destination: DestinationId,
        field: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub(crate) fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Errors raised by a [`crate::geo::GeoEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no projection from {from} to {to}")]
    UnsupportedProjection { from: SpatialRef, to: SpatialRef },

    #[error("cannot read raster {path}: {reason}")]
    RasterHeader { path: PathBuf, reason: String },

    #[error("rasterize failed: {0}")]
    Rasterize(String),
}

pub(crate) fn engine_io(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}

/// Errors raised by the source filter.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("cannot create scratch workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write filtered copy: {0}")]
    Write(#[from] GeoJsonError),
}

/// Errors raised by a [`crate::session::EditSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {op} while session is {from:?}")]
    InvalidTransition {
        from: SessionState,
        op: &'static str,
    },

    #[error("store error during {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("projection to destination reference failed: {0}")]
    Projection(#[source] EngineError),

    /// Row-count conservation failed after reconcile.
    #[error(
        "append verification failed for '{version}': pre {pre_count} + appended {appended_count} != post {post_count}"
    )]
    CountMismatch {
        version: VersionName,
        pre_count: u64,
        appended_count: u64,
        post_count: u64,
    },
}

/// Errors raised by an [`crate::archive::ArchiveStore`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error at {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn archive_io(path: impl Into<PathBuf>, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.into(),
        source,
    }
}

/// Errors raised by a [`crate::mirror::RemoteMirror`].
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("mirror returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("mirror unreachable: {0}")]
    Transport(String),

    #[error("unexpected mirror response: {0}")]
    Response(String),

    #[error("mirror API key not set (expected in ${0})")]
    MissingApiKey(String),
}

/// Errors raised by a single propagation action.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// Propagation was asked to run for an update that did not verify.
    #[error("refusing to propagate an unverified update of '{0}'")]
    NotCommitted(DestinationId),

    #[error("cannot read committed destination: {0}")]
    Read(#[source] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error("raster file set: {0}")]
    FileSet(String),

    /// The WGS 84 copy shared by the archive and mirror actions failed.
    #[error("cannot prepare public copy: {0}")]
    PublicCopy(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn propagation_io(path: impl Into<PathBuf>, source: std::io::Error) -> PropagationError {
    PropagationError::Io {
        path: path.into(),
        source,
    }
}

/// Pipeline stage names, used to report where a layer run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ReadSource,
    ArchiveSource,
    FilterSource,
    AssignIdentity,
    TagAttributes,
    BuildWhereClause,
    EditSession,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::ReadSource => "read source",
            Stage::ArchiveSource => "archive source",
            Stage::FilterSource => "filter source",
            Stage::AssignIdentity => "assign identity",
            Stage::TagAttributes => "tag attributes",
            Stage::BuildWhereClause => "build where clause",
            Stage::EditSession => "edit session",
        };
        f.write_str(s)
    }
}

/// Fatal failure of a layer run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{stage} failed: {source}")]
    Source {
        stage: Stage,
        #[source]
        source: GeoJsonError,
    },

    #[error("{stage} failed: {source}")]
    Archive {
        stage: Stage,
        #[source]
        source: ArchiveError,
    },

    #[error("{stage} failed: {source}")]
    Filter {
        stage: Stage,
        #[source]
        source: FilterError,
    },

    #[error("{stage} failed: {source}")]
    WhereClause {
        stage: Stage,
        #[source]
        source: WhereClauseError,
    },

    #[error("{stage} failed: {source}")]
    Session {
        stage: Stage,
        #[source]
        source: SessionError,
    },

    #[error("{stage} failed: {reason}")]
    Invalid { stage: Stage, reason: String },
}

impl OrchestratorError {
    pub fn stage(&self) -> Stage {
        match self {
            OrchestratorError::Source { stage, .. }
            | OrchestratorError::Archive { stage, .. }
            | OrchestratorError::Filter { stage, .. }
            | OrchestratorError::WhereClause { stage, .. }
            | OrchestratorError::Session { stage, .. }
            | OrchestratorError::Invalid { stage, .. } => *stage,
        }
    }
}

/// Errors from the run log.
#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run log JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn run_log_io(path: impl Into<PathBuf>, source: std::io::Error) -> RunLogError {
    RunLogError::Io {
        path: path.into(),
        source,
    }
}
