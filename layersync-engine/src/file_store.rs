//! File-backed [`VersionedStore`].
//!
//! The whole store lives in `<root>/store.json`. Every mutation loads the
//! state, applies the change and rewrites the file atomically (`.tmp` +
//! rename). Each load-modify-save holds an exclusive advisory lock on
//! `<root>/store.lock`, so layers running in separate processes (or threads)
//! against the same root never overwrite each other's changes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use chrono::Utc;
use tracing::debug;

use layersync_core::{
    Dataset, DestinationId, Feature, SpatialRef, UpdateWhereClause, VersionName,
};

use crate::context::OpContext;
use crate::error::{store_io, StoreError};
use crate::store::{
    AppendMode, DestinationSpec, ReconcileOutcome, ReconcilePolicy, VersionAccess,
    VersionDeletion, VersionInfo, VersionedStore,
};
use crate::store_state::StoreState;

/// Name of the state file inside the store root.
pub const STATE_FILE: &str = "store.json";

/// Name of the lock file serializing mutations.
pub const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open an existing store workspace.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StoreError::InvalidWorkspace {
                path: root,
                reason: "not an existing directory".into(),
            });
        }
        Ok(Self { root })
    }

    /// Create the store workspace if needed, then open it.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| store_io(&root, e))?;
        set_dir_permissions(&root)?;
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn create_destination(
        &self,
        id: &DestinationId,
        spec: DestinationSpec,
    ) -> Result<(), StoreError> {
        self.update(|s| s.create_destination(id, spec))
    }

    /// Load rows directly into the trunk.
    pub fn seed(&self, id: &DestinationId, features: Vec<Feature>) -> Result<u64, StoreError> {
        self.update(|s| s.seed(id, features))
    }

    pub fn destinations(&self) -> Result<Vec<DestinationId>, StoreError> {
        Ok(self.load()?.destination_ids())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn load(&self) -> Result<StoreState, StoreError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(StoreState::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| store_io(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, state: &StoreState) -> Result<(), StoreError> {
        let path = self.state_path();
        let tmp = self.root.join(format!("{STATE_FILE}.tmp"));
        let json = serde_json::to_string(state)?;
        std::fs::write(&tmp, json).map_err(|e| store_io(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(store_io(&path, e));
        }
        Ok(())
    }

    /// Block until this handle holds the store's exclusive lock.
    fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| store_io(&path, e))?;
        file.lock_exclusive().map_err(|e| store_io(&path, e))?;
        Ok(StoreLock { file })
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.save(&state)?;
        Ok(out)
    }
}

/// Held for the duration of one load-modify-save.
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl VersionedStore for FileStore {
    fn spatial_ref(&self, destination: &DestinationId) -> Result<SpatialRef, StoreError> {
        self.load()?.spatial_ref(destination)
    }

    fn create_version(
        &self,
        ctx: &OpContext,
        parent: &VersionName,
        name: &VersionName,
        access: VersionAccess,
    ) -> Result<(), StoreError> {
        debug!(layer = %ctx.layer, version = %name, store = %self.root.display(), "creating version");
        self.update(|s| s.create_version(parent, name, access, Utc::now()))
    }

    fn list_versions(&self) -> Result<Vec<VersionInfo>, StoreError> {
        Ok(self.load()?.list_versions())
    }

    fn delete_rows(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        destination: &DestinationId,
        selection: Option<&UpdateWhereClause>,
    ) -> Result<u64, StoreError> {
        let n = self.update(|s| s.delete_rows(version, destination, selection))?;
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
        let n = self.update(|s| s.append(version, destination, features, mode))?;
        debug!(layer = %ctx.layer, version = %version, appended = n, "rows appended");
        Ok(n)
    }

    fn count(&self, version: &VersionName, destination: &DestinationId) -> Result<u64, StoreError> {
        self.load()?.count(version, destination)
    }

    fn read(&self, version: &VersionName, destination: &DestinationId) -> Result<Dataset, StoreError> {
        self.load()?.read(version, destination)
    }

    fn reconcile(
        &self,
        ctx: &OpContext,
        version: &VersionName,
        target: &VersionName,
        policy: &ReconcilePolicy,
    ) -> Result<ReconcileOutcome, StoreError> {
        let outcome = self.update(|s| s.reconcile(version, target, policy))?;
        debug!(layer = %ctx.layer, version = %version, ?outcome, "reconciled");
        Ok(outcome)
    }

    fn delete_version(&self, ctx: &OpContext, name: &VersionName) -> Result<VersionDeletion, StoreError> {
        debug!(layer = %ctx.layer, version = %name, "deleting version");
        self.update(|s| s.delete_version(name))
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| store_io(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| store_io(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layersync_core::{Coord, Geometry};
    use tempfile::TempDir;

    fn ctx(tmp: &TempDir) -> OpContext {
        OpContext::new("parks", tmp.path().join("scratch"))
    }

    #[test]
    fn open_rejects_missing_workspace() {
        let tmp = TempDir::new().unwrap();
        let err = FileStore::open(tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidWorkspace { .. }));
    }

    #[test]
    fn state_persists_across_handles() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let dest = DestinationId::from("parks");
        let version = VersionName::from("parks_1");

        let store = FileStore::init(&root).unwrap();
        store
            .create_destination(&dest, DestinationSpec::new(SpatialRef::wgs84()))
            .unwrap();
        store
            .seed(&dest, vec![Feature::new(Geometry::Point(Coord::new(0.0, 0.0)))])
            .unwrap();
        store
            .create_version(&ctx(&tmp), &VersionName::trunk(), &version, VersionAccess::Private)
            .unwrap();
        store.delete_rows(&ctx(&tmp), &version, &dest, None).unwrap();

        let reopened = FileStore::open(&root).unwrap();
        assert_eq!(reopened.count(&version, &dest).unwrap(), 0);
        assert_eq!(reopened.count(&VersionName::trunk(), &dest).unwrap(), 1);
        assert_eq!(reopened.list_versions().unwrap()[0].name, version);
        assert!(!root.join("store.json.tmp").exists());
    }

    #[test]
    fn concurrent_handles_keep_every_version() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        FileStore::init(&root).unwrap();

        let workers: Vec<_> = ["parks", "roads"]
            .into_iter()
            .map(|layer| {
                let root = root.clone();
                let scratch = tmp.path().join(layer);
                std::thread::spawn(move || {
                    let store = FileStore::open(&root).unwrap();
                    let ctx = OpContext::new(layer, scratch);
                    for i in 0..100 {
                        let name = VersionName::from(format!("{layer}_{i}").as_str());
                        store
                            .create_version(&ctx, &VersionName::trunk(), &name, VersionAccess::Private)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let store = FileStore::open(&root).unwrap();
        assert_eq!(store.list_versions().unwrap().len(), 200);
        assert!(root.join(LOCK_FILE).exists());
    }

    #[test]
    fn failed_mutation_leaves_state_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::init(tmp.path().join("store")).unwrap();
        let err = store
            .delete_rows(&ctx(&tmp), &VersionName::from("missing"), &DestinationId::from("x"), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::DestinationNotFound(_)));
        assert!(!store.state_path().exists());
    }
}
