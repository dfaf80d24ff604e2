//! `digest`: weekly reading-list digest runner.
//!
//! # Usage
//!
//! ```text
//! digest init [--force]
//! digest run [--local] [--json]
//! digest history [--limit N] [--json]
//! digest episodes [--limit N] [--json]
//! digest fail-run <id> [--reason <text>]
//! digest daemon start|stop|status|logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, episodes::EpisodesArgs, fail_run::FailRunArgs, history::HistoryArgs,
    init::InitArgs, run::RunArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "digest",
    version,
    about = "Turn the week's saved articles into a notebook digest and audio episode",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default config to ~/.weekly-digest/config.yaml.
    Init(InitArgs),

    /// Run one weekly sync now.
    Run(RunArgs),

    /// List recent batch runs.
    History(HistoryArgs),

    /// List produced episodes.
    Episodes(EpisodesArgs),

    /// Mark a run that is stuck in `running` as failed.
    FailRun(FailRunArgs),

    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Run(args) => args.run(),
        Commands::History(args) => args.run(),
        Commands::Episodes(args) => args.run(),
        Commands::FailRun(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
