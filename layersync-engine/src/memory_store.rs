//! In-process [`VersionedStore`] backed by a mutex-guarded state.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use layersync_core::{
    Dataset, DestinationId, Feature, SpatialRef, UpdateWhereClause, VersionName,
};

use crate::context::OpContext;
use crate::error::StoreError;
use crate::store::{
    AppendMode, DestinationSpec, ReconcileOutcome, ReconcilePolicy, VersionAccess,
    VersionDeletion, VersionInfo, VersionedStore,
};
use crate::store_state::StoreState;

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_destination(
        &self,
        id: &DestinationId,
        spec: DestinationSpec,
    ) -> Result<(), StoreError> {
        self.lock()?.create_destination(id, spec)
    }

    /// Load rows directly into the trunk.
    pub fn seed(&self, id: &DestinationId, features: Vec<Feature>) -> Result<u64, StoreError> {
        self.lock()?.seed(id, features)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state lock poisoned".into()))
    }
}

impl VersionedStore for MemoryStore {
    fn spatial_ref(&self, destination: &DestinationId) -> Result<SpatialRef, StoreError> {
        self.lock()?.spatial_ref(destination)
    }

    fn create_version(
        &self,
        ctx: &OpContext,
        parent: &VersionName,
        name: &VersionName,
        access: VersionAccess,
    ) -> Result<(), StoreError> {
        debug!(layer = %ctx.layer, version = %name, "creating version");
        self.lock()?.create_version(parent, name, access, Utc::now())
    }

    fn list_versions(&self) -> Result<Vec<VersionInfo>, StoreError> {
        Ok(self.lock()?.list_versions())
    }

    fn delete_rows(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        destination: &DestinationId,
        selection: Option<&UpdateWhereClause>,
    ) -> Result<u64, StoreError> {
        let n = self.lock()?.delete_rows(version, destination, selection)?;
        debug!(layer = %ctx.layer, version = %version, deleted = n, "rows deleted");
        Ok(n)
    }

    fn append(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        destination: &DestinationId,
        features: &[Feature],
        mode: AppendMode,
    ) -> Result<u64, StoreError> {
        let n = self.lock()?.append(version, destination, features, mode)?;
        debug!(layer = %ctx.layer, version = %version, appended = n, "rows appended");
        Ok(n)
    }

    fn count(&self, version: &VersionName, destination: &DestinationId) -> Result<u64, StoreError> {
        self.lock()?.count(version, destination)
    }

    fn read(&self, version: &VersionName, destination: &DestinationId) -> Result<Dataset, StoreError> {
        self.lock()?.read(version, destination)
    }

    fn reconcile(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        target: &VersionName,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileOutcome, StoreError> {
        let outcome = self.lock()?.reconcile(version, target, policy)?;
        debug!(layer = %ctx.layer, version = %version, ?outcome, "reconciled");
        Ok(outcome)
    }

    fn delete_version(&self, ctx: &OpContext, name: &VersionName) -> Result<VersionDeletion, StoreError> {
        debug!(layer = %ctx.layer, version = %name, "deleting version");
        self.lock()?.delete_version(name)
    }
}
