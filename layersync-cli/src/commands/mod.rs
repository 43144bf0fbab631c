pub mod due;
pub mod run;
pub mod status;
pub mod store;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Datelike, Local};

use layersync_core::{registry, Settings};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn load_settings(home: &std::path::Path) -> Result<Settings> {
    registry::load_settings_at(home)
        .context("failed to load settings; create ~/.layersync/settings.yaml first")
}

/// `day` if given, otherwise today's day of the month.
pub(crate) fn day_of_month(day: Option<u32>) -> u32 {
    day.unwrap_or_else(|| Local::now().day())
}
