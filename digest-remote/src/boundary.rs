//! Narrow capability traits for the three remote collaborators.
//!
//! The sync engine only ever talks to these traits; HTTP adapters live in
//! [`crate::readeck`], [`crate::notebook`] and [`crate::upload`], in-memory
//! fakes in `crate::fake` behind the `test-support` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use digest_core::{GenerationKind, JobId, RunId, SourceRef};

use crate::error::RemoteError;

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// One candidate item from the bookmark archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveItem {
    pub source_ref: SourceRef,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Archive-side document type (`article`, `photo`, `pdf`, ...).
    #[serde(default)]
    pub kind: Option<String>,
}

impl ArchiveItem {
    pub fn new(source_ref: impl Into<SourceRef>, url: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            url: url.into(),
            title: None,
            kind: None,
        }
    }

    /// Whether the remote notebook can ingest the item by URL. PDFs cannot;
    /// they are submitted as pre-extracted text instead.
    pub fn is_browsable(&self) -> bool {
        let is_pdf = self.kind.as_deref() == Some("pdf")
            || self.url.to_ascii_lowercase().ends_with(".pdf");
        !is_pdf
    }
}

#[async_trait]
pub trait ArchiveBoundary: Send + Sync {
    /// Items created during the lookback window, newest first.
    async fn list_weekly_items(&self) -> Result<Vec<ArchiveItem>, RemoteError>;

    /// Extracted Markdown for an item, `None` when the archive has none.
    async fn fetch_extracted_text(&self, item: &ArchiveItem)
        -> Result<Option<String>, RemoteError>;
}

// ---------------------------------------------------------------------------
// Notebook / generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionPayload {
    Url(String),
    Text { title: Option<String>, content: String },
}

/// One source submission, carrying the key the remote service uses to
/// de-duplicate retried submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSubmission {
    pub source_ref: SourceRef,
    pub idempotency_key: String,
    pub payload: SubmissionPayload,
}

impl SourceSubmission {
    pub fn new(run_id: RunId, source_ref: SourceRef, payload: SubmissionPayload) -> Self {
        Self {
            idempotency_key: format!("{run_id}:{source_ref}"),
            source_ref,
            payload,
        }
    }
}

/// Parameters of an audio synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRequest {
    pub batch_id: String,
    pub episode_name: String,
    pub episode_profile: String,
    pub speaker_profile: String,
}

/// Status of a remote asynchronous job, as reported by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    /// Terminal success, with the produced artifact's id when there is one.
    Done(Option<String>),
    Failed(String),
}

impl RemoteStatus {
    /// Map a service status word: `completed` is done, `failed`/`error`
    /// are failures, anything else is still pending.
    pub fn from_status_word(status: &str, result_ref: Option<String>, detail: Option<String>) -> Self {
        match status {
            "completed" => RemoteStatus::Done(result_ref),
            "failed" | "error" => {
                RemoteStatus::Failed(detail.unwrap_or_else(|| format!("remote status '{status}'")))
            }
            _ => RemoteStatus::Pending,
        }
    }
}

#[async_trait]
pub trait NotebookBoundary: Send + Sync {
    /// Create the remote container for one run's sources.
    async fn create_batch(&self, name: &str, description: &str) -> Result<String, RemoteError>;

    async fn submit_source(
        &self,
        batch_id: &str,
        submission: &SourceSubmission,
    ) -> Result<JobId, RemoteError>;

    async fn fetch_source_status(&self, job: &JobId) -> Result<RemoteStatus, RemoteError>;

    async fn trigger_text_synthesis(&self, batch_id: &str) -> Result<JobId, RemoteError>;

    async fn trigger_audio_synthesis(&self, request: &AudioRequest)
        -> Result<JobId, RemoteError>;

    async fn fetch_job_status(
        &self,
        kind: GenerationKind,
        job: &JobId,
    ) -> Result<RemoteStatus, RemoteError>;

    async fn fetch_artifact(&self, result_ref: &str) -> Result<Vec<u8>, RemoteError>;
}

// ---------------------------------------------------------------------------
// Audio upload
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AudioUploader: Send + Sync {
    /// Store `bytes` under `filename` and return its public URL.
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError>;
}
