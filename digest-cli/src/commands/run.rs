//! `digest run`: one weekly sync, through the daemon when it is up.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use digest_core::{RunStatus, Settings};
use digest_daemon::{init_tracing, request_run, DaemonError};
use digest_sync::{RunSummary, WeeklySyncOrchestrator};

use super::{load_settings, print_json};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run in this process even when the daemon is listening.
    #[arg(long)]
    pub local: bool,

    /// Emit the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let (home, settings) = load_settings()?;
        let summary = if self.local {
            run_local(&home, settings)?
        } else {
            match request_run(&home) {
                Ok(summary) => summary,
                Err(DaemonError::DaemonNotRunning { .. }) => run_local(&home, settings)?,
                Err(err) => return Err(err).context("daemon refused the run"),
            }
        };

        if self.json {
            print_json(&summary)?;
        } else {
            print_summary(&summary);
        }
        if summary.status == RunStatus::Failed {
            bail!("run {} failed", summary.run_id);
        }
        Ok(())
    }
}

fn run_local(home: &Path, settings: Settings) -> Result<RunSummary> {
    init_tracing(settings.log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async {
        let orchestrator = WeeklySyncOrchestrator::from_settings(&settings, home)
            .context("failed to set up weekly sync")?;
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling; the run stays 'running' until failed or swept as stale");
                on_signal.cancel();
            }
        });
        orchestrator
            .run_weekly_sync(&cancel)
            .await
            .context("weekly sync did not finish")
    })
}

fn print_summary(summary: &RunSummary) {
    let status = match summary.status {
        RunStatus::Completed => summary.status.to_string().green(),
        RunStatus::CompletedWithErrors => summary.status.to_string().yellow(),
        RunStatus::Failed => summary.status.to_string().red(),
        RunStatus::Running => summary.status.to_string().cyan(),
    };
    println!(
        "Run {} {} ({} items: {} ingested, {} failed, {} timed out)",
        summary.run_id,
        status.bold(),
        summary.item_count,
        summary.counts.ingested,
        summary.counts.failed,
        summary.counts.timed_out,
    );
    if let Some(episode) = &summary.episode {
        let name = episode.name.as_deref().unwrap_or(&episode.artifact_ref);
        match &episode.public_url {
            Some(url) => println!("  Episode: {name} → {url}"),
            None => println!("  Episode: {name} (not published)"),
        }
    }
    if let Some(error) = &summary.error {
        println!("  {} {error}", "Problems:".yellow());
    }
}
