//! `digest fail-run <id> [--reason <text>]`

use anyhow::{Context, Result};
use clap::Args;

use digest_core::RunId;

use super::open_ledger;

/// Mark a batch run as failed.
#[derive(Args, Debug)]
pub struct FailRunArgs {
    /// Ledger id of the run (see `digest history`).
    pub id: i64,

    /// Reason recorded on the run.
    #[arg(long, default_value = "marked failed by operator")]
    pub reason: String,
}

impl FailRunArgs {
    pub fn run(self) -> Result<()> {
        let ledger = open_ledger()?;
        let run = ledger
            .fail_run(RunId(self.id), &self.reason)
            .with_context(|| format!("could not fail run {}", self.id))?;
        println!("✓ Run {} marked {} ({})", run.id, run.status, self.reason);
        Ok(())
    }
}
