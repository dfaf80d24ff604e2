//! `digest episodes`: produced audio episodes.

use anyhow::Result;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use digest_core::Episode;

use super::history::local_time;
use super::{open_ledger, print_json};

#[derive(Args, Debug)]
pub struct EpisodesArgs {
    #[arg(long, short = 'n', default_value_t = 10)]
    pub limit: usize,

    /// Only episodes whose audio was published.
    #[arg(long)]
    pub uploaded: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct EpisodeRow {
    #[tabled(rename = "episode")]
    id: i64,
    #[tabled(rename = "run")]
    run: i64,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "created")]
    created: String,
    #[tabled(rename = "published")]
    published: String,
}

impl EpisodesArgs {
    pub fn run(self) -> Result<()> {
        let ledger = open_ledger()?;
        let episodes = if self.uploaded {
            ledger.uploaded_episodes(self.limit)?
        } else {
            ledger.latest_episodes(self.limit)?
        };
        if self.json {
            return print_json(&episodes);
        }
        if episodes.is_empty() {
            println!("No episodes yet.");
            return Ok(());
        }
        let mut table = Table::new(episodes.into_iter().map(row));
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn row(episode: Episode) -> EpisodeRow {
    EpisodeRow {
        id: episode.id,
        run: episode.batch_run_id.0,
        name: episode.name.unwrap_or_else(|| episode.artifact_ref.clone()),
        created: local_time(episode.created_at),
        published: episode.public_url.unwrap_or_else(|| "no".to_string()),
    }
}
