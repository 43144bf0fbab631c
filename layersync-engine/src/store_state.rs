//! Store state shared by [`crate::MemoryStore`] and [`crate::FileStore`].
//!
//! The trunk keeps every row with the edit sequence number at which it was
//! posted. A version records only its own edits (deleted trunk object ids
//! and added rows), so reading a version overlays those edits on the live
//! trunk. A trunk row posted after the version was created and then deleted
//! in the version is an object conflict, as is an added row whose unique key
//! is already taken in the trunk.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layersync_core::{Dataset, DestinationId, Feature, UpdateWhereClause, Value, VersionName};

use crate::error::StoreError;
use crate::store::{
    AppendMode, ConflictGranularity, ConflictResolution, DestinationSpec, ReconcileOutcome,
    ReconcilePolicy, VersionAccess, VersionDeletion, VersionDisposal, VersionInfo,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    edit_seq: u64,
    #[serde(default)]
    destinations: BTreeMap<DestinationId, DestinationState>,
    #[serde(default)]
    versions: BTreeMap<VersionName, VersionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DestinationState {
    spatial_ref: layersync_core::SpatialRef,
    #[serde(default)]
    fields: Vec<layersync_core::FieldDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unique_field: Option<String>,
    next_oid: u64,
    #[serde(default)]
    rows: BTreeMap<u64, StoredRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredRow {
    feature: Feature,
    edited_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VersionState {
    parent: VersionName,
    access: VersionAccess,
    created_at: DateTime<Utc>,
    /// Trunk edit sequence at creation (or at the last post).
    base_seq: u64,
    #[serde(default)]
    edits: BTreeMap<DestinationId, VersionEdits>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct VersionEdits {
    #[serde(default)]
    deleted: BTreeSet<u64>,
    #[serde(default)]
    added: BTreeMap<u64, Feature>,
}

#[derive(Debug, Default)]
struct PostPlan {
    deletes: BTreeSet<u64>,
    inserts: Vec<(u64, Feature)>,
    conflicts: u64,
}

fn selects(selection: Option<&UpdateWhereClause>, feature: &Feature) -> bool {
    selection.map_or(true, |clause| clause.matches(feature))
}

/// Comparable form of a unique-key value; nulls never collide.
fn unique_key(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    serde_json::to_string(value).ok()
}

impl StoreState {
    // -----------------------------------------------------------------------
    // Destinations
    // -----------------------------------------------------------------------

    pub fn create_destination(
        &mut self,
        id: &DestinationId,
        spec: DestinationSpec,
    ) -> Result<(), StoreError> {
        if self.destinations.contains_key(id) {
            return Err(StoreError::DestinationExists(id.clone()));
        }
        self.destinations.insert(
            id.clone(),
            DestinationState {
                spatial_ref: spec.spatial_ref,
                fields: spec.fields,
                unique_field: spec.unique_field,
                next_oid: 1,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Insert rows straight into the trunk, bypassing versioning.
    pub fn seed(&mut self, id: &DestinationId, features: Vec<Feature>) -> Result<u64, StoreError> {
        let dest = self
            .destinations
            .get_mut(id)
            .ok_or_else(|| StoreError::DestinationNotFound(id.clone()))?;
        let mut n = 0;
        for feature in features {
            self.edit_seq += 1;
            dest.rows.insert(
                dest.next_oid,
                StoredRow {
                    feature,
                    edited_at: self.edit_seq,
                },
            );
            dest.next_oid += 1;
            n += 1;
        }
        Ok(n)
    }

    pub fn destination_ids(&self) -> Vec<DestinationId> {
        self.destinations.keys().cloned().collect()
    }

    fn destination(&self, id: &DestinationId) -> Result<&DestinationState, StoreError> {
        self.destinations
            .get(id)
            .ok_or_else(|| StoreError::DestinationNotFound(id.clone()))
    }

    pub fn spatial_ref(&self, id: &DestinationId) -> Result<layersync_core::SpatialRef, StoreError> {
        Ok(self.destination(id)?.spatial_ref.clone())
    }

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    pub fn create_version(
        &mut self,
        parent: &VersionName,
        name: &VersionName,
        access: VersionAccess,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !parent.is_trunk() {
            return Err(StoreError::UnsupportedParent(parent.clone()));
        }
        if name.is_trunk() || self.versions.contains_key(name) {
            return Err(StoreError::VersionExists(name.clone()));
        }
        self.versions.insert(
            name.clone(),
            VersionState {
                parent: parent.clone(),
                access,
                created_at: now,
                base_seq: self.edit_seq,
                edits: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn list_versions(&self) -> Vec<VersionInfo> {
        self.versions
            .iter()
            .map(|(name, v)| VersionInfo {
                name: name.clone(),
                parent: v.parent.clone(),
                access: v.access,
                created_at: v.created_at,
                edited: v
                    .edits
                    .iter()
                    .filter(|(_, e)| !e.deleted.is_empty() || !e.added.is_empty())
                    .map(|(d, _)| d.clone())
                    .collect(),
            })
            .collect()
    }

    pub fn delete_version(&mut self, name: &VersionName) -> Result<VersionDeletion, StoreError> {
        if name.is_trunk() {
            return Err(StoreError::TrunkProtected("deleted"));
        }
        Ok(match self.versions.remove(name) {
            Some(_) => VersionDeletion::Deleted,
            None => VersionDeletion::AlreadyAbsent,
        })
    }

    fn version(&self, name: &VersionName) -> Result<&VersionState, StoreError> {
        self.versions
            .get(name)
            .ok_or_else(|| StoreError::VersionNotFound(name.clone()))
    }

    /// Pending edits of `name` on `dest`, created on first touch.
    fn edits_mut(
        &mut self,
        name: &VersionName,
        dest: &DestinationId,
    ) -> Result<&mut VersionEdits, StoreError> {
        if name.is_trunk() {
            return Err(StoreError::TrunkProtected("edited directly"));
        }
        let version = self
            .versions
            .get_mut(name)
            .ok_or_else(|| StoreError::VersionNotFound(name.clone()))?;
        Ok(version.edits.entry(dest.clone()).or_default())
    }

    // -----------------------------------------------------------------------
    // Rows
    // -----------------------------------------------------------------------

    pub fn delete_rows(
        &mut self,
        version: &VersionName,
        dest_id: &DestinationId,
        selection: Option<&UpdateWhereClause>,
    ) -> Result<u64, StoreError> {
        let selected: Vec<u64> = {
            let dest = self.destination(dest_id)?;
            let deleted = self
                .version(version)
                .ok()
                .and_then(|v| v.edits.get(dest_id))
                .map(|e| &e.deleted);
            dest.rows
                .iter()
                .filter(|(oid, _)| deleted.map_or(true, |d| !d.contains(*oid)))
                .filter(|(_, row)| selects(selection, &row.feature))
                .map(|(oid, _)| *oid)
                .collect()
        };

        let edits = self.edits_mut(version, dest_id)?;
        let mut n = selected.len() as u64;
        edits.deleted.extend(selected);
        let before = edits.added.len();
        edits.added.retain(|_, f| !selects(selection, f));
        n += (before - edits.added.len()) as u64;
        Ok(n)
    }

    pub fn append(
        &mut self,
        version: &VersionName,
        dest_id: &DestinationId,
        features: &[Feature],
        mode: AppendMode,
    ) -> Result<u64, StoreError> {
        let (fields, mut next_oid) = {
            let dest = self.destination(dest_id)?;
            (dest.fields.clone(), dest.next_oid)
        };

        let mut rows = Vec::with_capacity(features.len());
        for feature in features {
            let mut feature = feature.clone();
            if !fields.is_empty() {
                if let Some(unknown) = feature
                    .attributes
                    .keys()
                    .find(|k| !fields.iter().any(|f| &f.name == *k))
                {
                    if mode == AppendMode::Test {
                        return Err(StoreError::SchemaMismatch {
                            destination: dest_id.clone(),
                            field: unknown.clone(),
                        });
                    }
                    feature
                        .attributes
                        .retain(|k, _| fields.iter().any(|f| &f.name == k));
                }
            }
            rows.push((next_oid, feature));
            next_oid += 1;
        }

        let n = rows.len() as u64;
        self.edits_mut(version, dest_id)?.added.extend(rows);
        if let Some(dest) = self.destinations.get_mut(dest_id) {
            dest.next_oid = next_oid;
        }
        Ok(n)
    }

    /// Rows of `dest` as seen from `version`, in object id order.
    fn view<'a>(
        &'a self,
        version: &VersionName,
        dest_id: &DestinationId,
    ) -> Result<Vec<&'a Feature>, StoreError> {
        let dest = self.destination(dest_id)?;
        if version.is_trunk() {
            return Ok(dest.rows.values().map(|r| &r.feature).collect());
        }
        let v = self.version(version)?;
        let Some(edits) = v.edits.get(dest_id) else {
            return Ok(dest.rows.values().map(|r| &r.feature).collect());
        };
        let mut rows: BTreeMap<u64, &Feature> = dest
            .rows
            .iter()
            .filter(|(oid, _)| !edits.deleted.contains(*oid))
            .map(|(oid, r)| (*oid, &r.feature))
            .collect();
        rows.extend(edits.added.iter().map(|(oid, f)| (*oid, f)));
        Ok(rows.into_values().collect())
    }

    pub fn count(&self, version: &VersionName, dest_id: &DestinationId) -> Result<u64, StoreError> {
        Ok(self.view(version, dest_id)?.len() as u64)
    }

    pub fn read(&self, version: &VersionName, dest_id: &DestinationId) -> Result<Dataset, StoreError> {
        let dest = self.destination(dest_id)?;
        let features = self.view(version, dest_id)?.into_iter().cloned().collect();
        Ok(Dataset {
            name: dest_id.0.clone(),
            spatial_ref: dest.spatial_ref.clone(),
            fields: dest.fields.clone(),
            features,
        })
    }

    // -----------------------------------------------------------------------
    // Reconcile and post
    // -----------------------------------------------------------------------

    pub fn reconcile(
        &mut self,
        version: &VersionName,
        target: &VersionName,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileOutcome, StoreError> {
        if version.is_trunk() {
            return Err(StoreError::TrunkProtected("reconciled into itself"));
        }
        if !target.is_trunk() {
            return Err(StoreError::UnsupportedParent(target.clone()));
        }
        if policy.granularity == ConflictGranularity::ByAttribute {
            return Err(StoreError::UnsupportedPolicy("conflict detection by attribute"));
        }

        let v = self.version(version)?;
        let mut outcome = ReconcileOutcome::default();
        let mut plans = Vec::with_capacity(v.edits.len());
        for (dest_id, edits) in &v.edits {
            let dest = self.destination(dest_id)?;
            let plan = plan_post(dest, edits, v.base_seq, policy.resolution);
            outcome.conflicts += plan.conflicts;
            plans.push((dest_id.clone(), plan));
        }

        if policy.abort_on_conflict && outcome.conflicts > 0 {
            return Err(StoreError::Conflicts {
                version: version.clone(),
                conflicts: outcome.conflicts as usize,
            });
        }
        if !policy.post {
            return Ok(outcome);
        }

        for (dest_id, plan) in plans {
            let Some(dest) = self.destinations.get_mut(&dest_id) else {
                continue;
            };
            for oid in &plan.deletes {
                if dest.rows.remove(oid).is_some() {
                    outcome.deletes_applied += 1;
                }
            }
            for (oid, feature) in plan.inserts {
                self.edit_seq += 1;
                dest.rows.insert(
                    oid,
                    StoredRow {
                        feature,
                        edited_at: self.edit_seq,
                    },
                );
                outcome.inserts_applied += 1;
            }
        }
        outcome.posted = true;

        match policy.delete_version {
            VersionDisposal::DeleteAfterPost => {
                self.versions.remove(version);
                outcome.version_deleted = true;
            }
            VersionDisposal::KeepVersion => {
                if let Some(v) = self.versions.get_mut(version) {
                    v.edits.clear();
                    v.base_seq = self.edit_seq;
                }
            }
        }
        Ok(outcome)
    }
}

fn plan_post(
    dest: &DestinationState,
    edits: &VersionEdits,
    base_seq: u64,
    resolution: ConflictResolution,
) -> PostPlan {
    let mut plan = PostPlan::default();

    for oid in &edits.deleted {
        let Some(row) = dest.rows.get(oid) else {
            continue;
        };
        if row.edited_at > base_seq {
            plan.conflicts += 1;
            if resolution == ConflictResolution::FavorTarget {
                continue;
            }
        }
        plan.deletes.insert(*oid);
    }

    let Some(field) = &dest.unique_field else {
        plan.inserts = edits.added.iter().map(|(o, f)| (*o, f.clone())).collect();
        return plan;
    };

    let mut owners: HashMap<String, u64> = dest
        .rows
        .iter()
        .filter(|(oid, _)| !plan.deletes.contains(*oid))
        .filter_map(|(oid, row)| unique_key(row.feature.get(field)).map(|k| (k, *oid)))
        .collect();

    for (oid, feature) in &edits.added {
        let key = unique_key(feature.get(field));
        if let Some(owner) = key.as_ref().and_then(|k| owners.get(k)).copied() {
            plan.conflicts += 1;
            match resolution {
                ConflictResolution::FavorTarget => continue,
                ConflictResolution::FavorEdit => {
                    if dest.rows.contains_key(&owner) {
                        plan.deletes.insert(owner);
                    } else {
                        plan.inserts.retain(|(o, _)| *o != owner);
                    }
                }
            }
        }
        if let Some(key) = key {
            owners.insert(key, *oid);
        }
        plan.inserts.push((*oid, feature.clone()));
    }
    plan
}
