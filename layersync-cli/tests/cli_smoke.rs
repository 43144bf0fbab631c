use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use layersync_core::{
    geojson, registry, Coord, Dataset, Feature, Geometry, LayerDef, Settings, SpatialRef,
    UpdateDays,
};

fn layersync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("layersync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

fn settings(home: &Path) -> Settings {
    let data = home.join("data");
    Settings {
        store_root: data.join("store"),
        archive_dir: data.join("archive"),
        download_dir: data.join("download"),
        scratch_root: data.join("scratch"),
        mirror: None,
    }
}

fn square(x: f64) -> Geometry {
    Geometry::Polygon(vec![vec![
        Coord::new(x, 0.0),
        Coord::new(x + 0.5, 0.0),
        Coord::new(x + 0.5, 0.5),
        Coord::new(x, 0.5),
        Coord::new(x, 0.0),
    ]])
}

/// Registers `imazon_sad` with a three-feature source, due on days 1-5.
fn register_layer(home: &Path) -> LayerDef {
    registry::save_settings_at(home, &settings(home)).expect("save settings");

    let source_path = home.join("imazon_sad.geojson");
    let mut source = Dataset::new("imazon_sad", SpatialRef::wgs84());
    source.features = (0..3)
        .map(|i| Feature::new(square(i as f64)).with("state", "PA"))
        .collect();
    geojson::write_path(&source_path, &source).expect("write source");

    let mut def = LayerDef::new("imazon_sad", source_path, "gfw.imazon_sad");
    def.country_code = Some("BRA".into());
    def.update_days = Some(UpdateDays::parse("[1-5]"));
    registry::save_layer_at(home, &def).expect("save layer");
    def
}

#[test]
fn init_run_and_status_round_trip() {
    let home = TempDir::new().expect("home");
    register_layer(home.path());

    layersync_cmd(home.path())
        .args(["store", "init", "gfw.imazon_sad", "--wkid", "4326"])
        .assert()
        .success()
        .stdout(contains("Created destination 'gfw.imazon_sad'"));

    layersync_cmd(home.path())
        .args(["run", "imazon_sad"])
        .assert()
        .success()
        .stdout(contains("'imazon_sad' updated (0 deleted, 3 appended, 3 rows now)"));

    assert!(home.path().join("data/download/imazon_sad.zip").is_file());
    assert!(home.path().join(".layersync/runs/imazon_sad.json").is_file());

    let assert = layersync_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("stdout utf8");
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("status json");
    assert_eq!(json[0]["layer"], "imazon_sad");
    assert_eq!(json[0]["last_run"]["status"], "succeeded");
    assert_eq!(json[0]["last_run"]["sync"]["post_count"], 3);

    layersync_cmd(home.path())
        .args(["store", "versions"])
        .assert()
        .success()
        .stdout(contains("No open versions."));
}

#[test]
fn run_without_store_fails_and_records_nothing() {
    let home = TempDir::new().expect("home");
    register_layer(home.path());

    layersync_cmd(home.path())
        .args(["run", "imazon_sad"])
        .assert()
        .failure()
        .stderr(contains("layersync store init"));
    assert!(!home.path().join(".layersync/runs/imazon_sad.json").exists());
}

#[test]
fn due_lists_scheduled_layers() {
    let home = TempDir::new().expect("home");
    register_layer(home.path());

    layersync_cmd(home.path())
        .args(["due", "--day", "3"])
        .assert()
        .success()
        .stdout(contains("imazon_sad"));

    layersync_cmd(home.path())
        .args(["due", "--day", "20"])
        .assert()
        .success()
        .stdout(contains("No layers due on day 20."));
}

#[test]
fn failed_layer_is_recorded_with_its_stage() {
    let home = TempDir::new().expect("home");
    let mut def = register_layer(home.path());
    def.merge_key = Some("biome".into());
    registry::save_layer_at(home.path(), &def).expect("save layer");

    layersync_cmd(home.path())
        .args(["store", "init", "gfw.imazon_sad"])
        .assert()
        .success();
    layersync_cmd(home.path())
        .args(["run", "--due", "--day", "2"])
        .assert()
        .failure()
        .stderr(contains("stopped at build where clause"));

    layersync_cmd(home.path())
        .args(["status"])
        .assert()
        .success()
        .stdout(contains("imazon_sad"))
        .stdout(contains("stopped at build where clause"));
}

#[test]
fn dropping_an_absent_version_succeeds() {
    let home = TempDir::new().expect("home");
    register_layer(home.path());
    layersync_cmd(home.path())
        .args(["store", "init", "gfw.imazon_sad"])
        .assert()
        .success();

    layersync_cmd(home.path())
        .args(["store", "drop-version", "imazon_sad_1709274600"])
        .assert()
        .success()
        .stdout(contains("was already absent"));
}
