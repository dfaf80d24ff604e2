//! One module per subcommand, plus helpers they share.

pub mod daemon;
pub mod episodes;
pub mod fail_run;
pub mod history;
pub mod init;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};

use digest_core::{config, Ledger, Settings};

/// Home directory plus settings with env overrides applied.
pub(crate) fn load_settings() -> Result<(PathBuf, Settings)> {
    let home = config::home().context("could not determine home directory")?;
    let mut settings = config::load_at(&home)
        .context("failed to load config; run `digest init` to write defaults")?;
    settings
        .apply_env()
        .context("invalid environment override")?;
    Ok((home, settings))
}

pub(crate) fn open_ledger() -> Result<Ledger> {
    let (home, settings) = load_settings()?;
    let path = settings.ledger_path(&home);
    Ledger::open(&path).with_context(|| format!("failed to open ledger at {}", path.display()))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON")?
    );
    Ok(())
}
