//! Ingestion barrier and the two sequential synthesis stages.
//!
//! ```text
//! AwaitingIngestion ─► Complete | Partial | Failed
//!                          │         │        └─► run fails, no generation
//!                          └────┬────┘
//!                               ▼
//!   TriggerText ─► await ─► TriggerAudio ─► await ─► Produced
//!        └──────────┴─────────────┴────────────┴──► Failed (fatal)
//! ```

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use digest_core::{
    GenerationJob, GenerationKind, GenerationState, ItemState, JobId, Ledger, OutcomeCounts,
    RunId, RunStage,
};
use digest_remote::{AudioRequest, NotebookBoundary};

use crate::batch::BatchSubmission;
use crate::error::SyncError;
use crate::options::SyncOptions;
use crate::poller::{
    GenerationStatus, PollConfig, PollOutcome, PollReport, RemoteJobPoller, SourceStatus,
};

/// Result of the ingestion barrier over every item of the run, including
/// items refused at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionOutcome {
    Complete(OutcomeCounts),
    Partial(OutcomeCounts),
    Failed(OutcomeCounts),
}

impl IngestionOutcome {
    fn from_counts(counts: OutcomeCounts) -> Self {
        if counts.ingested == 0 {
            IngestionOutcome::Failed(counts)
        } else if counts.ingested == counts.total() {
            IngestionOutcome::Complete(counts)
        } else {
            IngestionOutcome::Partial(counts)
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        match *self {
            IngestionOutcome::Complete(c)
            | IngestionOutcome::Partial(c)
            | IngestionOutcome::Failed(c) => c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Both stages completed; `artifact_ref` names the audio episode.
    Produced {
        text_ref: Option<String>,
        artifact_ref: String,
    },
    Failed {
        kind: GenerationKind,
        reason: String,
    },
}

pub struct GenerationCoordinator<'a> {
    notebook: &'a dyn NotebookBoundary,
    ledger: &'a Ledger,
    options: &'a SyncOptions,
}

impl<'a> GenerationCoordinator<'a> {
    pub fn new(
        notebook: &'a dyn NotebookBoundary,
        ledger: &'a Ledger,
        options: &'a SyncOptions,
    ) -> Self {
        Self {
            notebook,
            ledger,
            options,
        }
    }

    /// Wait until every accepted source is ingested, failed or timed out,
    /// and record each terminal state.
    pub async fn await_ingestion(
        &self,
        run_id: RunId,
        submission: BatchSubmission,
        cancel: &CancellationToken,
    ) -> Result<IngestionOutcome, SyncError> {
        self.ledger.record_stage(run_id, RunStage::AwaitingIngestion)?;

        let mut counts = OutcomeCounts::default();
        for _ in &submission.rejected {
            counts.add(ItemState::Failed);
        }

        let mut poller = RemoteJobPoller::new(self.options.source_poll);
        for submitted in &submission.accepted {
            poller.register_at(submitted.job_id.clone(), submitted.submitted_at);
        }
        let mut reports = poller
            .run(&SourceStatus(self.notebook), cancel)
            .await
            .map_err(|_| SyncError::Cancelled { run_id })?;

        for submitted in submission.accepted {
            let mut item = submitted.item;
            let (state, detail) = match reports.remove(&submitted.job_id) {
                Some(PollReport {
                    outcome: PollOutcome::Completed(_),
                    polls,
                    ..
                }) => {
                    item.attempts = polls;
                    (ItemState::Ingested, None)
                }
                Some(PollReport {
                    outcome: PollOutcome::Failed(reason),
                    polls,
                    ..
                }) => {
                    item.attempts = polls;
                    (ItemState::Failed, Some(reason.to_string()))
                }
                Some(PollReport { polls, .. }) => {
                    item.attempts = polls;
                    (ItemState::TimedOut, Some("ingestion timed out".to_string()))
                }
                None => (ItemState::TimedOut, Some("never polled".to_string())),
            };
            item.state = state;
            self.ledger
                .record_item_outcome(run_id, &item, detail.as_deref())?;
            counts.add(state);
        }

        let outcome = IngestionOutcome::from_counts(counts);
        tracing::info!(
            run_id = %run_id,
            ingested = counts.ingested,
            failed = counts.failed,
            timed_out = counts.timed_out,
            "ingestion resolved"
        );
        Ok(outcome)
    }

    /// Run text synthesis, then audio synthesis. Audio is never triggered
    /// unless text synthesis completed.
    pub async fn generate(
        &self,
        run_id: RunId,
        batch_id: &str,
        episode_name: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, SyncError> {
        self.ledger.record_stage(run_id, RunStage::TextSynthesis)?;
        let text_job = match self.notebook.trigger_text_synthesis(batch_id).await {
            Ok(job_id) => job_id,
            Err(err) => {
                return Ok(GenerationOutcome::Failed {
                    kind: GenerationKind::SynthesisText,
                    reason: format!("trigger refused: {err}"),
                })
            }
        };
        let text_ref = match self
            .await_job(run_id, GenerationKind::SynthesisText, text_job, cancel)
            .await?
        {
            Ok(result_ref) => result_ref,
            Err(reason) => {
                return Ok(GenerationOutcome::Failed {
                    kind: GenerationKind::SynthesisText,
                    reason,
                })
            }
        };

        self.ledger.record_stage(run_id, RunStage::AudioSynthesis)?;
        let request = AudioRequest {
            batch_id: batch_id.to_string(),
            episode_name: episode_name.to_string(),
            episode_profile: self.options.episode_profile.clone(),
            speaker_profile: self.options.speaker_profile.clone(),
        };
        let audio_job = match self.notebook.trigger_audio_synthesis(&request).await {
            Ok(job_id) => job_id,
            Err(err) => {
                return Ok(GenerationOutcome::Failed {
                    kind: GenerationKind::SynthesisAudio,
                    reason: format!("trigger refused: {err}"),
                })
            }
        };
        match self
            .await_job(run_id, GenerationKind::SynthesisAudio, audio_job, cancel)
            .await?
        {
            Ok(Some(artifact_ref)) => Ok(GenerationOutcome::Produced {
                text_ref,
                artifact_ref,
            }),
            Ok(None) => Ok(GenerationOutcome::Failed {
                kind: GenerationKind::SynthesisAudio,
                reason: "completed without an episode id".to_string(),
            }),
            Err(reason) => Ok(GenerationOutcome::Failed {
                kind: GenerationKind::SynthesisAudio,
                reason,
            }),
        }
    }

    /// Poll one synthesis job to a terminal state and record it. The inner
    /// result is the job's result reference or a failure reason.
    async fn await_job(
        &self,
        run_id: RunId,
        kind: GenerationKind,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<Result<Option<String>, String>, SyncError> {
        let mut job = GenerationJob {
            job_id: job_id.clone(),
            kind,
            state: GenerationState::Submitted,
            result_ref: None,
            poll_count: 0,
        };
        self.ledger.record_generation_job(run_id, &job)?;

        job.state = GenerationState::Polling;
        self.ledger.record_generation_job(run_id, &job)?;

        let mut poller = RemoteJobPoller::new(self.poll_config(kind));
        poller.register(job_id.clone());
        let fetcher = GenerationStatus {
            notebook: self.notebook,
            kind,
        };
        let mut reports: HashMap<JobId, PollReport> = poller
            .run(&fetcher, cancel)
            .await
            .map_err(|_| SyncError::Cancelled { run_id })?;

        let report = reports.remove(&job_id);
        job.poll_count = report.as_ref().map_or(0, |r| r.polls);
        let result = match report.map(|r| r.outcome) {
            Some(PollOutcome::Completed(result_ref)) => {
                job.state = GenerationState::Completed;
                job.result_ref = result_ref.clone();
                Ok(result_ref)
            }
            Some(PollOutcome::Failed(reason)) => {
                job.state = GenerationState::Failed;
                Err(reason.to_string())
            }
            Some(PollOutcome::TimedOut) | None => {
                job.state = GenerationState::TimedOut;
                Err(format!(
                    "timed out after {}s",
                    self.poll_config(kind).timeout.as_secs()
                ))
            }
        };
        self.ledger.record_generation_job(run_id, &job)?;
        tracing::info!(
            run_id = %run_id,
            job_id = %job.job_id,
            kind = %kind,
            state = %job.state,
            polls = job.poll_count,
            "generation job resolved"
        );
        Ok(result)
    }

    fn poll_config(&self, kind: GenerationKind) -> PollConfig {
        match kind {
            GenerationKind::SynthesisText => self.options.text_poll,
            GenerationKind::SynthesisAudio => self.options.audio_poll,
        }
    }
}
