//! End-to-end layer runs against the in-process and file-backed stores.

use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use layersync_core::{
    Coord, Dataset, DestinationId, Feature, Geometry, LayerDef, LayerName, Predicate, SpatialRef,
    UpdateWhereClause, Value, VersionName,
};
use layersync_engine::identity::{identity_of, IDENTITY_FIELD};
use layersync_engine::orchestrator::COUNTRY_FIELD;
use layersync_engine::session;
use layersync_engine::{
    ActionOutcome, Collaborators, DestinationSpec, FileStore, MemoryStore, OpContext, OrchestratorError,
    PlanarEngine, RecordingMirror, SessionError, Stage, SyncOrchestrator, VersionDeletion,
    VersionedStore, ZipArchiveStore,
};

fn started() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).unwrap()
}

fn square(x: f64, y: f64) -> Geometry {
    Geometry::Polygon(vec![vec![
        Coord::new(x, y),
        Coord::new(x + 0.5, y),
        Coord::new(x + 0.5, y + 0.5),
        Coord::new(x, y + 0.5),
        Coord::new(x, y),
    ]])
}

fn row(i: usize, region: &str) -> Feature {
    Feature::new(square(i as f64, if region == "R1" { 0.0 } else { 10.0 }))
        .with("region", region)
        .with("n", i as i64)
}

/// 30 rows in R1 and 50 in R2.
fn seeded_rows() -> Vec<Feature> {
    (0..30)
        .map(|i| row(i, "R1"))
        .chain((0..50).map(|i| row(i, "R2")))
        .collect()
}

/// 100 fresh R1 rows, offset so none share a geometry with the trunk.
fn r1_source() -> Dataset {
    let mut ds = Dataset::new("forest_loss", SpatialRef::wgs84());
    ds.features = (0..100).map(|i| row(i + 1000, "R1")).collect();
    ds
}

fn layer_def(tmp: &Path) -> LayerDef {
    let mut def = LayerDef::new("forest_loss", tmp.join("forest_loss.geojson"), "gfw.forest_loss");
    def.merge_key = Some("region".into());
    def.country_code = Some("BRA".into());
    def.mirror_table = Some("forest_loss".into());
    def
}

fn archive(tmp: &Path) -> ZipArchiveStore {
    ZipArchiveStore::new(tmp.join("archive"), tmp.join("download"))
}

#[test]
fn scoped_update_replaces_one_region_and_propagates() {
    let tmp = TempDir::new().expect("tempdir");
    let def = layer_def(tmp.path());
    let store = MemoryStore::new();
    store
        .create_destination(&def.destination, DestinationSpec::new(SpatialRef::wgs84()))
        .expect("create destination");
    store.seed(&def.destination, seeded_rows()).expect("seed");

    let archive = archive(tmp.path());
    let mirror = RecordingMirror::new();
    let orchestrator = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: Some(&mirror),
    });

    let outcome = orchestrator
        .run_layer(&def, &tmp.path().join("scratch"), r1_source(), started())
        .expect("layer run");

    let sync = &outcome.sync;
    assert_eq!(sync.initial_count, 80);
    assert_eq!(sync.deleted_count, 30);
    assert_eq!(sync.pre_count, 50);
    assert_eq!(sync.appended_count, 100);
    assert_eq!(sync.post_count, 150);
    assert!(sync.is_consistent());

    let trunk = store
        .read(&VersionName::trunk(), &def.destination)
        .expect("read trunk");
    let r1: Vec<&Feature> = trunk
        .features
        .iter()
        .filter(|f| f.get("region") == &Value::from("R1"))
        .collect();
    assert_eq!(r1.len(), 100);
    for f in &r1 {
        let geometry = f.geometry.as_ref().expect("geometry");
        assert_eq!(f.get(IDENTITY_FIELD), &Value::from(identity_of(geometry).0));
        assert_eq!(f.get(COUNTRY_FIELD), &Value::from("BRA"));
    }
    assert!(store.list_versions().expect("versions").is_empty());

    let calls = mirror.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].table, "forest_loss");
    assert_eq!(calls[0].rows, 100);
    let clause = calls[0].delete.as_ref().expect("scoped delete");
    assert_eq!(clause.to_sql(), "\"region\" IN ('R1')");

    assert!(tmp.path().join("archive/forest_loss_20240301063000.zip").is_file());
    assert!(tmp.path().join("archive/src/forest_loss_20240301063000.zip").is_file());
    assert!(tmp.path().join("download/forest_loss.zip").is_file());
    assert!(!tmp.path().join("download/forest_loss_local.zip").exists());

    assert!(matches!(outcome.propagation.raster, ActionOutcome::Skipped { .. }));
    assert!(!outcome.propagation.has_failures());
}

#[test]
fn dropped_duplicate_stops_the_run_before_propagation() {
    let tmp = TempDir::new().expect("tempdir");
    let def = layer_def(tmp.path());
    let source = r1_source();

    // An R2 row already carries the id one source feature will get.
    let clash = identity_of(source.features[0].geometry.as_ref().expect("geometry"));
    let mut rows = seeded_rows();
    rows[40].set(IDENTITY_FIELD, clash.0);

    let store = MemoryStore::new();
    store
        .create_destination(
            &def.destination,
            DestinationSpec::new(SpatialRef::wgs84()).with_unique_field(IDENTITY_FIELD),
        )
        .expect("create destination");
    store.seed(&def.destination, rows).expect("seed");

    let archive = archive(tmp.path());
    let mirror = RecordingMirror::new();
    let orchestrator = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: Some(&mirror),
    });

    let err = orchestrator
        .run_layer(&def, &tmp.path().join("scratch"), source, started())
        .expect_err("count mismatch");
    assert_eq!(err.stage(), Stage::EditSession);
    let OrchestratorError::Session {
        source:
            SessionError::CountMismatch {
                pre_count,
                appended_count,
                post_count,
                ..
            },
        ..
    } = &err
    else {
        panic!("expected a count mismatch, got {err}");
    };
    assert_eq!((*pre_count, *appended_count, *post_count), (50, 100, 149));

    assert!(mirror.calls().is_empty());
    assert!(!tmp.path().join("archive/forest_loss_20240301063000.zip").exists());
    assert!(tmp.path().join("archive/src/forest_loss_20240301063000.zip").is_file());

    let version = VersionName::for_layer(&LayerName::from("forest_loss"), started());
    let versions = store.list_versions().expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].name, version);

    let ctx = OpContext::new("forest_loss", tmp.path());
    assert_eq!(
        store.delete_version(&ctx, &version).expect("delete"),
        VersionDeletion::Deleted
    );
    assert_eq!(
        store.delete_version(&ctx, &version).expect("delete again"),
        VersionDeletion::AlreadyAbsent
    );
}

#[test]
fn full_replace_without_merge_key_truncates_the_mirror() {
    let tmp = TempDir::new().expect("tempdir");
    let mut def = layer_def(tmp.path());
    def.merge_key = None;

    let store = MemoryStore::new();
    store
        .create_destination(&def.destination, DestinationSpec::new(SpatialRef::wgs84()))
        .expect("create destination");
    store.seed(&def.destination, seeded_rows()).expect("seed");

    let archive = archive(tmp.path());
    let mirror = RecordingMirror::new();
    let outcome = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: Some(&mirror),
    })
    .run_layer(&def, &tmp.path().join("scratch"), r1_source(), started())
    .expect("layer run");

    assert_eq!(outcome.sync.deleted_count, 80);
    assert_eq!(outcome.sync.pre_count, 0);
    assert_eq!(outcome.sync.post_count, 100);
    let calls = mirror.calls();
    assert_eq!(calls[0].delete, None);
    assert_eq!(calls[0].rows, 100);
}

#[test]
fn source_filter_narrows_what_is_appended() {
    let tmp = TempDir::new().expect("tempdir");
    let mut def = layer_def(tmp.path());
    def.filter = Some(Predicate::parse("n >= 1010").expect("predicate"));

    let store = MemoryStore::new();
    store
        .create_destination(&def.destination, DestinationSpec::new(SpatialRef::wgs84()))
        .expect("create destination");
    store.seed(&def.destination, seeded_rows()).expect("seed");

    let archive = archive(tmp.path());
    let outcome = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: None,
    })
    .run_layer(&def, &tmp.path().join("scratch"), r1_source(), started())
    .expect("layer run");

    assert_eq!(outcome.sync.appended_count, 10);
    assert_eq!(outcome.sync.post_count, 60);
    assert!(tmp.path().join("scratch/forest_loss.geojson").is_file());
    assert!(matches!(outcome.propagation.mirror, ActionOutcome::Skipped { .. }));
}

#[test]
fn file_store_update_survives_reopen() {
    let tmp = TempDir::new().expect("tempdir");
    let def = layer_def(tmp.path());
    let root = tmp.path().join("store");
    {
        let store = FileStore::init(&root).expect("init store");
        store
            .create_destination(&def.destination, DestinationSpec::new(SpatialRef::wgs84()))
            .expect("create destination");
        store.seed(&def.destination, seeded_rows()).expect("seed");

        let archive = archive(tmp.path());
        let outcome = SyncOrchestrator::new(Collaborators {
            store: &store,
            engine: &PlanarEngine,
            archive: &archive,
            mirror: None,
        })
        .run_layer(&def, &tmp.path().join("scratch"), r1_source(), started())
        .expect("layer run");
        assert_eq!(outcome.sync.post_count, 150);
    }

    let reopened = FileStore::open(&root).expect("open store");
    assert_eq!(
        reopened
            .count(&VersionName::trunk(), &DestinationId::from("gfw.forest_loss"))
            .expect("count"),
        150
    );
    assert!(reopened.list_versions().expect("versions").is_empty());
}

#[test]
fn concurrent_layers_on_one_file_store_keep_every_commit() {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().join("store");
    let store = FileStore::init(&root).expect("init store");
    let layers = ["forest_loss", "fires"];
    for layer in layers {
        store
            .create_destination(
                &DestinationId::from(format!("gfw.{layer}")),
                DestinationSpec::new(SpatialRef::wgs84()),
            )
            .expect("create destination");
    }

    let workers: Vec<_> = layers
        .into_iter()
        .map(|layer| {
            let root = root.clone();
            let scratch = tmp.path().join("scratch").join(layer);
            std::thread::spawn(move || {
                let store = FileStore::open(&root).expect("open store");
                let ctx = OpContext::new(layer, scratch);
                let destination = DestinationId::from(format!("gfw.{layer}"));
                for run in 0..8 {
                    let batch = format!("run{run}");
                    let mut source = Dataset::new(layer, SpatialRef::wgs84());
                    source.features = (0..5)
                        .map(|i| row(run * 10 + i, "R1").with("batch", batch.as_str()))
                        .collect();
                    let clause = UpdateWhereClause::from_source(&source, "batch").expect("clause");
                    session::run(
                        &store,
                        &PlanarEngine,
                        &ctx,
                        &destination,
                        &source,
                        Some(&clause),
                        started() + Duration::seconds(run as i64),
                    )
                    .expect("verified commit");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("layer thread");
    }

    let reopened = FileStore::open(&root).expect("open store");
    for layer in layers {
        let destination = DestinationId::from(format!("gfw.{layer}"));
        assert_eq!(
            reopened
                .count(&VersionName::trunk(), &destination)
                .expect("count"),
            40,
            "{layer}"
        );
    }
    assert!(reopened.list_versions().expect("versions").is_empty());
}

#[test]
fn unknown_merge_key_fails_before_any_edit() {
    let tmp = TempDir::new().expect("tempdir");
    let mut def = layer_def(tmp.path());
    def.merge_key = Some("biome".into());

    let store = MemoryStore::new();
    store
        .create_destination(&def.destination, DestinationSpec::new(SpatialRef::wgs84()))
        .expect("create destination");
    store.seed(&def.destination, seeded_rows()).expect("seed");

    let archive = archive(tmp.path());
    let err = SyncOrchestrator::new(Collaborators {
        store: &store,
        engine: &PlanarEngine,
        archive: &archive,
        mirror: None,
    })
    .run_layer(&def, &tmp.path().join("scratch"), r1_source(), started())
    .expect_err("missing merge key");

    assert_eq!(err.stage(), Stage::BuildWhereClause);
    assert!(store.list_versions().expect("versions").is_empty());
    assert_eq!(
        store
            .count(&VersionName::trunk(), &def.destination)
            .expect("count"),
        80
    );
}
