//! `digest init [--force]`

use anyhow::{Context, Result};
use clap::Args;

use digest_core::{config, paths, Settings};

/// Write the default config file.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing config with defaults.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = config::home().context("could not determine home directory")?;
        let existing = paths::config_path(&home);
        if existing.exists() && !self.force {
            println!("Config already exists at {}", existing.display());
            println!("  Use --force to reset it to defaults.");
            return Ok(());
        }

        let path = config::save_at(&home, &Settings::default())
            .with_context(|| format!("failed to write {}", existing.display()))?;
        println!("✓ Wrote default config to {}", path.display());
        println!("  Set archive.token and notebook.password, or export DIGEST_READECK_TOKEN / DIGEST_NOTEBOOK_PASSWORD.");
        Ok(())
    }
}
