//! `layersync due`: layers scheduled for a day of the month.

use anyhow::{Context, Result};
use clap::Args;

use layersync_core::{registry, schedule};

use super::{day_of_month, home_dir};

/// Arguments for `layersync due`.
#[derive(Args, Debug)]
pub struct DueArgs {
    /// Day of the month to check instead of today.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=31))]
    pub day: Option<u32>,
}

impl DueArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let day = day_of_month(self.day);
        let layers = registry::list_layers_at(&home).context("failed to load layer definitions")?;

        let due: Vec<_> = layers
            .iter()
            .filter(|def| schedule::is_due(def.update_days.as_ref(), day))
            .collect();
        if due.is_empty() {
            println!("No layers due on day {day}.");
            return Ok(());
        }
        for def in due {
            println!("{}", def.name);
        }
        Ok(())
    }
}
