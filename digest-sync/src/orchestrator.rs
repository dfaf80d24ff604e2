//! Weekly sync entrypoint shared by the CLI and the daemon.
//!
//! One call to [`WeeklySyncOrchestrator::run_weekly_sync`] is one batch
//! run:
//!
//! ```text
//! sweep stale ─► begin_run ─► list items ─► create batch ─► submit
//!   ─► await ingestion ─► text synthesis ─► audio synthesis ─► publish
//!   ─► complete_run
//! ```
//!
//! Item-level failures are absorbed and recorded; stage-level failures end
//! the run with a recorded reason. Only single-flight rejection,
//! cancellation and ledger failures surface as [`SyncError`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use digest_core::{
    BatchRun, Episode, GenerationKind, ItemState, Ledger, OutcomeCounts, RunId, RunStage,
    RunStatus, Settings, SourceItem,
};
use digest_remote::{
    episode_filename, ArchiveBoundary, ArchiveItem, AudioUploader, LocalUploader,
    NotebookBoundary, OpenNotebookClient, ReadeckClient,
};

use crate::batch::BatchBuilder;
use crate::error::SyncError;
use crate::generation::{GenerationCoordinator, GenerationOutcome, IngestionOutcome};
use crate::options::SyncOptions;
use crate::staleness::sweep_stale_runs;

/// What a caller sees once a run reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub item_count: u32,
    pub counts: OutcomeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<Episode>,
}

impl RunSummary {
    fn new(run: BatchRun, episode: Option<Episode>) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            item_count: run.item_count,
            counts: run.counts,
            error: run.error,
            episode,
        }
    }
}

/// Terminal decision for a run, applied by `complete_run`.
struct Finish {
    status: RunStatus,
    error: Option<String>,
    episode: Option<Episode>,
}

impl Finish {
    fn failed(reason: String) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(reason),
            episode: None,
        }
    }

    fn from_problems(problems: Vec<String>, episode: Option<Episode>) -> Self {
        let status = if problems.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        Self {
            status,
            error: (!problems.is_empty()).then(|| problems.join("; ")),
            episode,
        }
    }
}

pub struct WeeklySyncOrchestrator {
    ledger: Arc<Ledger>,
    archive: Arc<dyn ArchiveBoundary>,
    notebook: Arc<dyn NotebookBoundary>,
    uploader: Option<Arc<dyn AudioUploader>>,
    options: SyncOptions,
}

impl WeeklySyncOrchestrator {
    pub fn new(
        ledger: Arc<Ledger>,
        archive: Arc<dyn ArchiveBoundary>,
        notebook: Arc<dyn NotebookBoundary>,
        options: SyncOptions,
    ) -> Self {
        Self {
            ledger,
            archive,
            notebook,
            uploader: None,
            options,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn AudioUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Wire the production adapters and ledger described by `settings`.
    pub fn from_settings(settings: &Settings, home: &Path) -> Result<Self, SyncError> {
        let ledger = Arc::new(Ledger::open(&settings.ledger_path(home))?);
        let timeout = settings.http_timeout();
        let archive = Arc::new(ReadeckClient::new(&settings.archive, timeout)?);
        let notebook = Arc::new(OpenNotebookClient::new(&settings.notebook, timeout)?);
        let orchestrator = Self::new(
            ledger,
            archive,
            notebook,
            SyncOptions::from_settings(settings),
        );
        Ok(if settings.audio.enabled {
            orchestrator.with_uploader(Arc::new(LocalUploader::new(
                settings.audio_dir(home),
                settings.audio.public_url.clone(),
            )))
        } else {
            orchestrator
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn latest_episodes(&self, limit: usize) -> Result<Vec<Episode>, SyncError> {
        Ok(self.ledger.latest_episodes(limit)?)
    }

    pub fn run_history(&self, limit: usize) -> Result<Vec<BatchRun>, SyncError> {
        Ok(self.ledger.run_history(limit)?)
    }

    /// Fail `running` rows that stopped making progress. A no-op when no
    /// staleness window is configured.
    pub fn sweep_stale_runs(&self) -> Result<Vec<BatchRun>, SyncError> {
        match self.options.stale_after {
            Some(stale_after) => Ok(sweep_stale_runs(&self.ledger, stale_after)?),
            None => Ok(Vec::new()),
        }
    }

    /// Run one weekly batch to a terminal status.
    ///
    /// Returns [`SyncError::AlreadyRunning`] without side effects while
    /// another run is active, and [`SyncError::Cancelled`] when `cancel`
    /// fires mid-run (the run's row stays `running`).
    pub async fn run_weekly_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, SyncError> {
        self.sweep_stale_runs()?;
        let run = self.ledger.begin_run(0).map_err(SyncError::from_begin)?;
        let run_id = run.id;
        tracing::info!(run_id = %run_id, "weekly sync started");

        let finish = match self.drive(run_id, cancel).await {
            Ok(finish) => finish,
            Err(SyncError::Cancelled { run_id }) => {
                tracing::warn!(run_id = %run_id, "weekly sync cancelled; run left running");
                return Err(SyncError::Cancelled { run_id });
            }
            Err(err) => {
                if let Err(fail_err) = self.ledger.fail_run(run_id, &err.to_string()) {
                    tracing::error!(run_id = %run_id, error = %fail_err, "could not fail run");
                }
                return Err(err);
            }
        };

        let completed = self
            .ledger
            .complete_run(run_id, finish.status, finish.error.as_deref())?;
        if !self.options.retain_item_outcomes {
            let pruned = self.ledger.prune_item_outcomes(run_id)?;
            tracing::debug!(run_id = %run_id, pruned, "item outcomes pruned");
        }

        tracing::info!(
            run_id = %run_id,
            status = %completed.status,
            items = completed.item_count,
            ingested = completed.counts.ingested,
            failed = completed.counts.failed,
            timed_out = completed.counts.timed_out,
            error = completed.error.as_deref().unwrap_or(""),
            "weekly sync finished"
        );
        Ok(RunSummary::new(completed, finish.episode))
    }

    async fn drive(&self, run_id: RunId, cancel: &CancellationToken) -> Result<Finish, SyncError> {
        let items = match self.archive.list_weekly_items().await {
            Ok(items) => dedup_items(run_id, items),
            Err(err) => return Ok(Finish::failed(format!("archive listing failed: {err}"))),
        };
        self.ledger
            .set_item_count(run_id, u32::try_from(items.len()).unwrap_or(u32::MAX))?;
        if items.is_empty() {
            tracing::info!(run_id = %run_id, "no items this week");
            return Ok(Finish::from_problems(Vec::new(), None));
        }
        ensure_live(run_id, cancel)?;

        self.ledger.record_stage(run_id, RunStage::Submitting)?;
        let name = self.batch_name();
        let description = format!("{} articles", items.len());
        let batch_id = match self.notebook.create_batch(&name, &description).await {
            Ok(batch_id) => batch_id,
            Err(err) => {
                let reason = format!("batch creation failed: {err}");
                self.fail_items(run_id, &items, &reason)?;
                return Ok(Finish::failed(reason));
            }
        };
        self.ledger.set_batch_ref(run_id, &batch_id)?;

        let submission = BatchBuilder::new(self.archive.as_ref(), self.notebook.as_ref(), &self.ledger)
            .submit(run_id, &batch_id, &items)
            .await?;
        ensure_live(run_id, cancel)?;

        let coordinator =
            GenerationCoordinator::new(self.notebook.as_ref(), &self.ledger, &self.options);
        let mut problems = Vec::new();
        match coordinator.await_ingestion(run_id, submission, cancel).await? {
            IngestionOutcome::Failed(counts) => {
                return Ok(Finish::failed(format!(
                    "AllItemsFailed: none of {} items were ingested ({} failed, {} timed out)",
                    counts.total(),
                    counts.failed,
                    counts.timed_out
                )));
            }
            IngestionOutcome::Partial(counts) => problems.push(describe_partial(counts)),
            IngestionOutcome::Complete(_) => {}
        }
        ensure_live(run_id, cancel)?;

        match coordinator.generate(run_id, &batch_id, &name, cancel).await? {
            GenerationOutcome::Failed { kind, reason } => {
                problems.push(format!("{} failed: {reason}", stage_label(kind)));
                Ok(Finish::failed(problems.join("; ")))
            }
            GenerationOutcome::Produced { artifact_ref, .. } => {
                self.ledger.record_stage(run_id, RunStage::Publishing)?;
                let (episode, publish_error) = self.publish(run_id, &artifact_ref, &name).await?;
                problems.extend(publish_error);
                Ok(Finish::from_problems(problems, Some(episode)))
            }
        }
    }

    /// Record the episode, then hand its audio to the uploader. Download or
    /// upload trouble is reported, not fatal.
    async fn publish(
        &self,
        run_id: RunId,
        artifact_ref: &str,
        name: &str,
    ) -> Result<(Episode, Option<String>), SyncError> {
        let episode = self.ledger.add_episode(run_id, artifact_ref, Some(name))?;
        let Some(uploader) = &self.uploader else {
            return Ok((episode, None));
        };

        let bytes = match self.notebook.fetch_artifact(artifact_ref).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(run_id = %run_id, artifact_ref, error = %err, "audio download failed");
                return Ok((episode, Some(format!("audio download failed: {err}"))));
            }
        };
        let filename = episode_filename(artifact_ref, Utc::now());
        match uploader.upload(&bytes, &filename).await {
            Ok(public_url) => {
                tracing::info!(run_id = %run_id, artifact_ref, public_url = %public_url, "episode published");
                let uploaded = self.ledger.mark_episode_uploaded(episode.id, &public_url)?;
                Ok((uploaded.unwrap_or(episode), None))
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, artifact_ref, error = %err, "audio upload failed");
                Ok((episode, Some(format!("audio upload failed: {err}"))))
            }
        }
    }

    fn fail_items(&self, run_id: RunId, items: &[ArchiveItem], reason: &str) -> Result<(), SyncError> {
        for archive_item in items {
            let mut item = SourceItem::new(archive_item.source_ref.clone());
            item.state = ItemState::Failed;
            self.ledger.record_item_outcome(run_id, &item, Some(reason))?;
        }
        Ok(())
    }

    fn batch_name(&self) -> String {
        format!(
            "{} {}",
            self.options.name_prefix,
            chrono::Local::now().format("%d/%m/%Y")
        )
    }
}

fn ensure_live(run_id: RunId, cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled { run_id })
    } else {
        Ok(())
    }
}

/// Keep the first listing of each source; outcomes are keyed by source.
fn dedup_items(run_id: RunId, items: Vec<ArchiveItem>) -> Vec<ArchiveItem> {
    let listed = items.len();
    let mut seen = HashSet::new();
    let items: Vec<ArchiveItem> = items
        .into_iter()
        .filter(|item| seen.insert(item.source_ref.clone()))
        .collect();
    if items.len() < listed {
        tracing::warn!(
            run_id = %run_id,
            duplicates = listed - items.len(),
            "archive listed duplicate sources"
        );
    }
    items
}

fn describe_partial(counts: OutcomeCounts) -> String {
    let unsuccessful = counts.failed + counts.timed_out;
    let mut text = format!(
        "{unsuccessful} of {} items failed ingestion",
        counts.total()
    );
    if counts.timed_out > 0 {
        text.push_str(&format!(" ({} timed out)", counts.timed_out));
    }
    text
}

fn stage_label(kind: GenerationKind) -> &'static str {
    match kind {
        GenerationKind::SynthesisText => "text synthesis",
        GenerationKind::SynthesisAudio => "audio synthesis",
    }
}
