//! Versioned store abstraction.
//!
//! A store holds destinations (feature tables) in a trunk version named
//! `DEFAULT`. Edits happen in private child versions that readers of the
//! trunk cannot see until the version is reconciled and posted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layersync_core::{
    Dataset, DestinationId, Feature, FieldDef, SpatialRef, UpdateWhereClause, VersionName,
};

use crate::context::OpContext;
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Policy and outcome types
// ---------------------------------------------------------------------------

/// Who may see and edit a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionAccess {
    Private,
    Protected,
    Public,
}

/// Schema handling on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Every attribute must be a destination column.
    Test,
    /// Attributes are matched by name; unknown ones are dropped.
    NoTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictGranularity {
    ByObject,
    ByAttribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The trunk's state wins; the conflicting edit is discarded.
    FavorTarget,
    /// The version's edit wins; the conflicting trunk row is replaced.
    FavorEdit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDisposal {
    DeleteAfterPost,
    KeepVersion,
}

/// How a version is merged into the trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub granularity: ConflictGranularity,
    pub resolution: ConflictResolution,
    /// Fail without posting when any conflict is detected.
    pub abort_on_conflict: bool,
    /// Apply the reconciled edits to the trunk.
    pub post: bool,
    pub delete_version: VersionDisposal,
}

impl Default for ReconcilePolicy {
    /// Object-level detection, trunk wins, no abort, post, keep the version.
    fn default() -> Self {
        Self {
            granularity: ConflictGranularity::ByObject,
            resolution: ConflictResolution::FavorTarget,
            abort_on_conflict: false,
            post: true,
            delete_version: VersionDisposal::KeepVersion,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub posted: bool,
    pub conflicts: u64,
    pub deletes_applied: u64,
    pub inserts_applied: u64,
    pub version_deleted: bool,
}

/// Result of deleting a version. An already-absent version is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDeletion {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub name: VersionName,
    pub parent: VersionName,
    pub access: VersionAccess,
    pub created_at: DateTime<Utc>,
    /// Destinations with pending (unposted) edits.
    pub edited: Vec<DestinationId>,
}

/// Definition of a new destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    pub spatial_ref: SpatialRef,
    /// Declared columns. An empty schema accepts any attribute.
    pub fields: Vec<FieldDef>,
    /// Column whose non-null values must be unique in the trunk.
    pub unique_field: Option<String>,
}

impl DestinationSpec {
    pub fn new(spatial_ref: SpatialRef) -> Self {
        Self {
            spatial_ref,
            fields: Vec::new(),
            unique_field: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_unique_field(mut self, field: impl Into<String>) -> Self {
        self.unique_field = Some(field.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A multi-version feature store.
///
/// `selection: None` on [`VersionedStore::delete_rows`] selects every row of
/// the destination.
pub trait VersionedStore {
    fn spatial_ref(&self, destination: &DestinationId) -> Result<SpatialRef, StoreError>;

    fn create_version(
        &self,
        ctx: &OpContext,
        parent: &VersionName,
        name: &VersionName,
        access: VersionAccess,
    ) -> Result<(), StoreError>;

    fn list_versions(&self) -> Result<Vec<VersionInfo>, StoreError>;

    /// Delete the selected rows as seen from `version`; returns how many.
    fn delete_rows(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        destination: &DestinationId,
        selection: Option<&UpdateWhereClause>,
    ) -> Result<u64, StoreError>;

    /// Insert `features` into `version`; returns how many were accepted.
    fn append(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        destination: &DestinationId,
        features: &[Feature],
        mode: AppendMode,
    ) -> Result<u64, StoreError>;

    fn count(&self, version: &VersionName, destination: &DestinationId) -> Result<u64, StoreError>;

    fn read(&self, version: &VersionName, destination: &DestinationId) -> Result<Dataset, StoreError>;

    fn reconcile(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        target: &VersionName,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileOutcome, StoreError>;

    fn delete_version(&self, ctx: &OpContext, name: &VersionName) -> Result<VersionDeletion, StoreError>;
}
