//! layersync core library: domain types, geometry, predicates, registry.
//!
//! - [`types`]: features, datasets, names and spatial references
//! - [`geometry`]: planar geometries and canonical WKT
//! - [`predicate`]: SQL-like attribute predicates
//! - [`where_clause`]: merge-key delete scope for updates
//! - [`geojson`]: dataset exchange format
//! - [`registry`]: layer definitions and settings (YAML)
//! - [`schedule`]: day-of-month update schedules

pub mod error;
pub mod geojson;
pub mod geometry;
pub mod predicate;
pub mod registry;
pub mod schedule;
pub mod types;
pub mod where_clause;

pub use error::{GeoJsonError, PredicateError, RegistryError, WhereClauseError};
pub use geometry::{Coord, Envelope, Geometry, Ring};
pub use predicate::Predicate;
pub use registry::{LayerDef, MirrorSettings, RasterTargetDef, Settings};
pub use schedule::UpdateDays;
pub use types::{
    Dataset, DestinationId, Feature, FieldDef, FieldKind, LayerName, SpatialRef, Value,
    VersionName,
};
pub use where_clause::{quote_ident, KeyValue, UpdateWhereClause};
