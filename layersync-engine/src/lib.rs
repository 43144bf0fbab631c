//! layersync engine: versioned updates and their propagation.
//!
//! - [`identity`]: content-derived `gfwid` assignment
//! - [`filter`]: source filtering into the scratch workspace
//! - [`store`]: versioned store trait, with [`MemoryStore`] and [`FileStore`]
//! - [`session`]: delete-then-append edit session with count verification
//! - [`geo`]: geoprocessing trait and the planar engine
//! - [`raster`], [`archive`], [`mirror`]: downstream products
//! - [`propagate`]: independent post-commit actions
//! - [`orchestrator`]: the per-layer pipeline
//! - [`run_log`]: persisted record of each layer's latest run

pub mod archive;
pub mod context;
pub mod error;
pub mod file_store;
pub mod filter;
pub mod geo;
pub mod identity;
pub mod memory_store;
pub mod mirror;
pub mod orchestrator;
pub mod propagate;
pub mod raster;
pub mod report;
pub mod run_log;
pub mod session;
pub mod store;
mod store_state;

pub use archive::{ArchiveStore, ZipArchiveStore};
pub use context::OpContext;
pub use error::{
    ArchiveError, EngineError, FilterError, MirrorError, OrchestratorError, PropagationError,
    RunLogError, SessionError, Stage, StoreError,
};
pub use file_store::FileStore;
pub use geo::{GeoEngine, PlanarEngine, RasterSpec};
pub use memory_store::MemoryStore;
pub use mirror::{RecordingMirror, RemoteMirror, SqlApiMirror};
pub use orchestrator::SyncOrchestrator;
pub use propagate::{Collaborators, PropagationCoordinator, PropagationPlan};
pub use report::{ActionOutcome, LayerRunOutcome, PropagationReport, SyncResult, SyncWarning};
pub use run_log::{RunRecord, RunStatus};
pub use session::{EditSession, SessionState};
pub use store::{
    AppendMode, DestinationSpec, ReconcilePolicy, VersionAccess, VersionDeletion, VersionInfo,
    VersionedStore,
};
