//! `layersync store init|versions|drop-version`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use layersync_core::{DestinationId, SpatialRef, VersionName};
use layersync_engine::{
    DestinationSpec, FileStore, OpContext, VersionDeletion, VersionedStore,
};

use super::{home_dir, load_settings};

/// Manage the file-backed versioned store.
#[derive(Subcommand, Debug)]
pub enum StoreCommand {
    /// Create an empty destination, creating the store if needed.
    Init(InitArgs),

    /// List open edit versions (left behind by failed runs).
    Versions,

    /// Delete an edit version. Deleting an absent version succeeds.
    DropVersion {
        /// Version name, as shown by `layersync store versions`.
        name: String,
    },
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Destination identifier (e.g. "gfw.imazon_sad").
    pub destination: String,

    /// Spatial reference of the destination.
    #[arg(long, default_value_t = SpatialRef::WGS84)]
    pub wkid: u32,

    /// Field whose values must be unique across the destination.
    #[arg(long)]
    pub unique_field: Option<String>,
}

pub fn run(cmd: StoreCommand) -> Result<()> {
    match cmd {
        StoreCommand::Init(args) => init(args),
        StoreCommand::Versions => versions(),
        StoreCommand::DropVersion { name } => drop_version(&name),
    }
}

fn open_store() -> Result<FileStore> {
    let settings = load_settings(&home_dir()?)?;
    FileStore::open(&settings.store_root).with_context(|| {
        format!(
            "failed to open store at {}; run `layersync store init` first",
            settings.store_root.display()
        )
    })
}

fn init(args: InitArgs) -> Result<()> {
    let settings = load_settings(&home_dir()?)?;
    let store = FileStore::init(&settings.store_root)
        .with_context(|| format!("failed to create store at {}", settings.store_root.display()))?;

    let mut spec = DestinationSpec::new(SpatialRef::from_wkid(args.wkid));
    if let Some(field) = args.unique_field {
        spec = spec.with_unique_field(field);
    }
    let id = DestinationId::from(args.destination.as_str());
    store
        .create_destination(&id, spec)
        .with_context(|| format!("failed to create destination '{id}'"))?;
    println!("✓ Created destination '{id}' (wkid {})", args.wkid);
    Ok(())
}

fn versions() -> Result<()> {
    let store = open_store()?;
    let versions = store.list_versions().context("failed to list versions")?;
    if versions.is_empty() {
        println!("No open versions.");
        return Ok(());
    }
    for v in versions {
        let edited: Vec<&str> = v.edited.iter().map(|d| d.0.as_str()).collect();
        println!(
            "{}  {}  {:?}  {}",
            v.name,
            v.created_at.format("%Y-%m-%d %H:%M:%S"),
            v.access,
            if edited.is_empty() { "-".to_owned() } else { edited.join(", ") }
        );
    }
    Ok(())
}

fn drop_version(name: &str) -> Result<()> {
    let store = open_store()?;
    let ctx = OpContext::new("store", store.root());
    let version = VersionName::from(name);
    let deletion = store
        .delete_version(&ctx, &version)
        .with_context(|| format!("failed to delete version '{name}'"))?;
    match deletion {
        VersionDeletion::Deleted => println!("✓ Deleted version '{name}'"),
        VersionDeletion::AlreadyAbsent => println!("✓ Version '{name}' was already absent"),
    }
    Ok(())
}
