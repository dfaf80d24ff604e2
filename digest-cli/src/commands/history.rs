//! `digest history`: recent batch runs from the ledger.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use digest_core::{BatchRun, RunStatus};

use super::{open_ledger, print_json};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of runs to show, newest first.
    #[arg(long, short = 'n', default_value_t = 10)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "run")]
    id: i64,
    #[tabled(rename = "started")]
    started: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "stage")]
    stage: String,
    #[tabled(rename = "items")]
    items: u32,
    #[tabled(rename = "ingested")]
    ingested: u32,
    #[tabled(rename = "failed")]
    failed: u32,
    #[tabled(rename = "timed out")]
    timed_out: u32,
    #[tabled(rename = "error")]
    error: String,
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let runs = open_ledger()?.run_history(self.limit)?;
        if self.json {
            return print_json(&runs);
        }
        if runs.is_empty() {
            println!("No runs recorded yet.");
            return Ok(());
        }

        let running = runs.iter().filter(|r| r.status == RunStatus::Running).count();
        let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
        println!(
            "{} runs | {} running | {} failed",
            runs.len(),
            running.to_string().cyan(),
            failed.to_string().red(),
        );
        let mut table = Table::new(runs.into_iter().map(row));
        table.with(Style::rounded());
        println!("{table}");
        if running > 0 {
            println!("A run stuck in 'running' blocks new runs; clear it with 'digest fail-run <id>'.");
        }
        Ok(())
    }
}

fn row(run: BatchRun) -> RunRow {
    RunRow {
        id: run.id.0,
        started: local_time(run.started_at),
        status: run.status.to_string(),
        stage: run.stage.to_string(),
        items: run.item_count,
        ingested: run.counts.ingested,
        failed: run.counts.failed,
        timed_out: run.counts.timed_out,
        error: run.error.map(|e| truncate(&e, 60)).unwrap_or_default(),
    }
}

pub(crate) fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
