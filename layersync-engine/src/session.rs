//! Versioned delete-then-append edit session.
//!
//! A session owns one private version of the store for the length of an
//! update:
//!
//! ```text
//! Created → Deleting → Appending → Reconciling → Verified → Committed
//!                 any failure ↘ Failed
//! ```
//!
//! Rows deleted and appended in the version stay invisible to trunk readers
//! until reconcile posts them. After posting, the trunk count must equal
//! the version count measured after the delete plus the appended rows;
//! otherwise the session fails and the version is left for diagnosis.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use layersync_core::{Dataset, DestinationId, UpdateWhereClause, VersionName};

use crate::context::OpContext;
use crate::error::{SessionError, StoreError};
use crate::geo::GeoEngine;
use crate::report::{SyncResult, SyncWarning};
use crate::store::{
    AppendMode, ReconcileOutcome, ReconcilePolicy, VersionAccess, VersionDeletion, VersionedStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Deleting,
    Appending,
    Reconciling,
    Verified,
    Committed,
    Failed,
}

pub struct EditSession<'a> {
    store: &'a dyn VersionedStore,
    ctx: &'a OpContext,
    destination: DestinationId,
    version: VersionName,
    state: SessionState,
    initial_count: u64,
    deleted_count: u64,
    pre_count: u64,
    appended_count: u64,
    post_count: u64,
    warnings: Vec<SyncWarning>,
}

impl<'a> EditSession<'a> {
    /// Create the private version `<layer>_<unixtime>` off the trunk.
    pub fn create(
        store: &'a dyn VersionedStore,
        ctx: &'a OpContext,
        destination: DestinationId,
        started_at: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        let version = VersionName::for_layer(&ctx.layer, started_at);
        store
            .create_version(ctx, &VersionName::trunk(), &version, VersionAccess::Private)
            .map_err(|source| SessionError::Store {
                op: "create version",
                source,
            })?;
        info!(layer = %ctx.layer, version = %version, destination = %destination, "edit version created");

        Ok(Self {
            store,
            ctx,
            destination,
            version,
            state: SessionState::Created,
            initial_count: 0,
            deleted_count: 0,
            pre_count: 0,
            appended_count: 0,
            post_count: 0,
            warnings: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> &VersionName {
        &self.version
    }

    pub fn warnings(&self) -> &[SyncWarning] {
        &self.warnings
    }

    /// Counts gathered so far.
    pub fn result(&self) -> SyncResult {
        SyncResult {
            destination: self.destination.clone(),
            version: self.version.clone(),
            initial_count: self.initial_count,
            deleted_count: self.deleted_count,
            pre_count: self.pre_count,
            appended_count: self.appended_count,
            post_count: self.post_count,
            warnings: self.warnings.clone(),
        }
    }

    fn require(&self, expected: SessionState, op: &'static str) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                op,
            });
        }
        Ok(())
    }

    fn fail(&mut self, op: &'static str, source: StoreError) -> SessionError {
        self.state = SessionState::Failed;
        SessionError::Store { op, source }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Delete the rows this update replaces; `None` deletes all of them.
    pub fn delete(&mut self, clause: Option<&UpdateWhereClause>) -> Result<u64, SessionError> {
        self.require(SessionState::Created, "delete")?;
        self.state = SessionState::Deleting;

        let (store, ctx) = (self.store, self.ctx);
        self.initial_count = store
            .count(&self.version, &self.destination)
            .map_err(|e| self.fail("count", e))?;
        self.deleted_count = store
            .delete_rows(ctx, &self.version, &self.destination, clause)
            .map_err(|e| self.fail("delete rows", e))?;
        self.pre_count = store
            .count(&self.version, &self.destination)
            .map_err(|e| self.fail("count", e))?;

        info!(
            layer = %ctx.layer,
            scope = %clause.map_or_else(|| "all rows".to_owned(), |c| c.to_sql()),
            deleted = self.deleted_count,
            remaining = self.pre_count,
            "rows deleted in version"
        );
        Ok(self.deleted_count)
    }

    /// Project `source` into the destination's reference when they differ.
    pub fn project_source<'d>(
        &mut self,
        source: &'d Dataset,
        engine: &dyn GeoEngine,
    ) -> Result<Cow<'d, Dataset>, SessionError> {
        self.require(SessionState::Deleting, "project source")?;

        let target = self
            .store
            .spatial_ref(&self.destination)
            .map_err(|e| self.fail("read spatial reference", e))?;
        if source.spatial_ref == target {
            return Ok(Cow::Borrowed(source));
        }

        if self.ctx.transformation.is_none() {
            let warning = SyncWarning::MissingTransformation {
                from: source.spatial_ref.wkid,
                to: target.wkid,
            };
            warn!(layer = %self.ctx.layer, "{warning}");
            self.warnings.push(warning);
        }
        match engine.project(self.ctx, source, &target) {
            Ok(projected) => Ok(Cow::Owned(projected)),
            Err(e) => {
                self.state = SessionState::Failed;
                Err(SessionError::Projection(e))
            }
        }
    }

    /// Append every feature of `source` to the version.
    pub fn append(&mut self, source: &Dataset) -> Result<u64, SessionError> {
        self.require(SessionState::Deleting, "append")?;
        self.state = SessionState::Appending;

        let accepted = self
            .store
            .append(self.ctx, &self.version, &self.destination, &source.features, AppendMode::NoTest)
            .map_err(|e| self.fail("append", e))?;
        self.appended_count = source.len() as u64;
        if accepted != self.appended_count {
            debug!(
                layer = %self.ctx.layer,
                accepted,
                offered = self.appended_count,
                "store accepted a different number of rows"
            );
        }
        info!(layer = %self.ctx.layer, appended = self.appended_count, "rows appended in version");
        Ok(self.appended_count)
    }

    /// Reconcile with the trunk favoring the trunk, then post.
    ///
    /// The version is kept so that a failed verification leaves it behind.
    pub fn reconcile(&mut self) -> Result<ReconcileOutcome, SessionError> {
        self.require(SessionState::Appending, "reconcile")?;
        self.state = SessionState::Reconciling;

        let trunk = VersionName::trunk();
        let outcome = self
            .store
            .reconcile(self.ctx, &self.version, &trunk, &ReconcilePolicy::default())
            .map_err(|e| self.fail("reconcile", e))?;
        self.post_count = self
            .store
            .count(&trunk, &self.destination)
            .map_err(|e| self.fail("count", e))?;
        info!(
            layer = %self.ctx.layer,
            conflicts = outcome.conflicts,
            post_count = self.post_count,
            "version reconciled and posted"
        );
        Ok(outcome)
    }

    /// Check row conservation: `pre_count + appended_count == post_count`.
    pub fn verify(&mut self) -> Result<(), SessionError> {
        self.require(SessionState::Reconciling, "verify")?;
        let result = self.result();
        if !result.is_consistent() {
            self.state = SessionState::Failed;
            return Err(SessionError::CountMismatch {
                version: self.version.clone(),
                pre_count: self.pre_count,
                appended_count: self.appended_count,
                post_count: self.post_count,
            });
        }
        self.state = SessionState::Verified;
        Ok(())
    }

    /// Delete the version. An already-absent version counts as success.
    pub fn cleanup(&mut self) -> Result<SyncResult, SessionError> {
        self.require(SessionState::Verified, "clean up")?;
        let deletion = self
            .store
            .delete_version(self.ctx, &self.version)
            .map_err(|e| self.fail("delete version", e))?;
        if deletion == VersionDeletion::AlreadyAbsent {
            self.warnings.push(SyncWarning::VersionAlreadyAbsent {
                version: self.version.clone(),
            });
        }
        self.state = SessionState::Committed;
        info!(layer = %self.ctx.layer, version = %self.version, "update committed");
        Ok(self.result())
    }
}

/// Drive a full session: create, delete, project, append, reconcile,
/// verify and clean up.
pub fn run(
    store: &dyn VersionedStore,
    engine: &dyn GeoEngine,
    ctx: &OpContext,
    destination: &DestinationId,
    source: &Dataset,
    clause: Option<&UpdateWhereClause>,
    started_at: DateTime<Utc>,
) -> Result<SyncResult, SessionError> {
    let mut session = EditSession::create(store, ctx, destination.clone(), started_at)?;
    session.delete(clause)?;
    let source = session.project_source(source, engine)?;
    session.append(&source)?;
    session.reconcile()?;
    session.verify()?;
    session.cleanup()
}
