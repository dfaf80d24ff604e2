//! In-memory implementations of the boundary traits with scripted
//! responses and call logs. No network, deterministic under a paused
//! tokio clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use digest_core::{GenerationKind, JobId, SourceRef};

use crate::boundary::{
    ArchiveBoundary, ArchiveItem, AudioRequest, AudioUploader, NotebookBoundary, RemoteStatus,
    SourceSubmission, SubmissionPayload,
};
use crate::error::RemoteError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// One scripted response to a status fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Status(RemoteStatus),
    Transient,
    Reject,
}

impl Step {
    pub fn pending() -> Self {
        Step::Status(RemoteStatus::Pending)
    }

    pub fn done() -> Self {
        Step::Status(RemoteStatus::Done(None))
    }

    pub fn done_with(result_ref: &str) -> Self {
        Step::Status(RemoteStatus::Done(Some(result_ref.to_string())))
    }

    pub fn failed(reason: &str) -> Self {
        Step::Status(RemoteStatus::Failed(reason.to_string()))
    }
}

/// Sequence of steps; the last one repeats forever.
#[derive(Debug, Clone)]
struct Script(VecDeque<Step>);

impl Script {
    fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        let steps: VecDeque<Step> = steps.into_iter().collect();
        if steps.is_empty() {
            Script(VecDeque::from([Step::done()]))
        } else {
            Script(steps)
        }
    }

    fn next(&mut self) -> Result<RemoteStatus, RemoteError> {
        let step = if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        };
        match step.unwrap_or_else(Step::done) {
            Step::Status(status) => Ok(status),
            Step::Transient => Err(RemoteError::Transient("scripted outage".into())),
            Step::Reject => Err(RemoteError::rejected("scripted rejection")),
        }
    }
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeArchive {
    items: Vec<ArchiveItem>,
    texts: HashMap<SourceRef, String>,
    listing_error: Option<String>,
    list_calls: AtomicUsize,
    text_fetches: Mutex<Vec<SourceRef>>,
}

impl FakeArchive {
    pub fn new(items: Vec<ArchiveItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// `n` browsable items `item-0 .. item-{n-1}`.
    pub fn with_items(n: usize) -> Self {
        Self::new(
            (0..n)
                .map(|i| ArchiveItem::new(format!("item-{i}"), format!("https://example.org/{i}")))
                .collect(),
        )
    }

    pub fn with_text(mut self, source_ref: &str, text: &str) -> Self {
        self.texts.insert(SourceRef::from(source_ref), text.to_string());
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.listing_error = Some(reason.to_string());
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn text_fetches(&self) -> Vec<SourceRef> {
        lock(&self.text_fetches).clone()
    }
}

#[async_trait]
impl ArchiveBoundary for FakeArchive {
    async fn list_weekly_items(&self) -> Result<Vec<ArchiveItem>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        match &self.listing_error {
            Some(reason) => Err(RemoteError::Transient(reason.clone())),
            None => Ok(self.items.clone()),
        }
    }

    async fn fetch_extracted_text(
        &self,
        item: &ArchiveItem,
    ) -> Result<Option<String>, RemoteError> {
        lock(&self.text_fetches).push(item.source_ref.clone());
        Ok(self.texts.get(&item.source_ref).cloned())
    }
}

// ---------------------------------------------------------------------------
// Notebook
// ---------------------------------------------------------------------------

/// Every call the fake notebook received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotebookCall {
    CreateBatch { name: String, description: String },
    SubmitSource {
        source_ref: SourceRef,
        idempotency_key: String,
        as_text: bool,
    },
    SourceStatus { job: JobId },
    TriggerText { batch_id: String },
    TriggerAudio { episode_name: String },
    JobStatus { kind: GenerationKind },
    FetchArtifact { result_ref: String },
}

impl NotebookCall {
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            NotebookCall::TriggerText { .. }
                | NotebookCall::TriggerAudio { .. }
                | NotebookCall::JobStatus { .. }
                | NotebookCall::FetchArtifact { .. }
        )
    }
}

#[derive(Debug)]
struct NotebookState {
    calls: Vec<NotebookCall>,
    rejected: HashSet<SourceRef>,
    source_scripts: HashMap<SourceRef, Script>,
    default_source: Vec<Step>,
    job_sources: HashMap<JobId, SourceRef>,
    submissions: HashMap<String, JobId>,
    text_script: Script,
    audio_script: Script,
    reject_text_trigger: bool,
    artifact: Option<Vec<u8>>,
    jobs_issued: usize,
}

#[derive(Debug)]
pub struct FakeNotebook {
    state: Mutex<NotebookState>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FakeNotebook {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNotebook {
    /// Every source ingests on first poll; both synthesis jobs complete on
    /// first poll.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotebookState {
                calls: Vec::new(),
                rejected: HashSet::new(),
                source_scripts: HashMap::new(),
                default_source: vec![Step::done()],
                job_sources: HashMap::new(),
                submissions: HashMap::new(),
                text_script: Script::new([Step::done_with("note:1")]),
                audio_script: Script::new([Step::done_with("episode:1")]),
                reject_text_trigger: false,
                artifact: Some(b"ID3-fake-audio".to_vec()),
                jobs_issued: 0,
            }),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Refuse submission of `source_ref`.
    pub fn reject_source(self, source_ref: &str) -> Self {
        lock(&self.state).rejected.insert(SourceRef::from(source_ref));
        self
    }

    /// Status sequence for one source.
    pub fn source_script(self, source_ref: &str, steps: Vec<Step>) -> Self {
        lock(&self.state)
            .source_scripts
            .insert(SourceRef::from(source_ref), Script::new(steps));
        self
    }

    /// Status sequence for every source without its own script.
    pub fn default_source_script(self, steps: Vec<Step>) -> Self {
        lock(&self.state).default_source = steps;
        self
    }

    pub fn text_script(self, steps: Vec<Step>) -> Self {
        lock(&self.state).text_script = Script::new(steps);
        self
    }

    pub fn audio_script(self, steps: Vec<Step>) -> Self {
        lock(&self.state).audio_script = Script::new(steps);
        self
    }

    pub fn reject_text_trigger(self) -> Self {
        lock(&self.state).reject_text_trigger = true;
        self
    }

    /// Make `fetch_artifact` fail.
    pub fn without_artifact(self) -> Self {
        lock(&self.state).artifact = None;
        self
    }

    /// Simulated round-trip time of each source status fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<NotebookCall> {
        lock(&self.state).calls.clone()
    }

    pub fn generation_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.is_generation()).count()
    }

    pub fn audio_triggered(&self) -> bool {
        self.calls()
            .iter()
            .any(|c| matches!(c, NotebookCall::TriggerAudio { .. }))
    }

    pub fn source_status_fetches(&self, source_ref: &str) -> usize {
        let job = source_job_id(&SourceRef::from(source_ref));
        self.calls()
            .iter()
            .filter(|c| matches!(c, NotebookCall::SourceStatus { job: j } if *j == job))
            .count()
    }

    /// Highest number of concurrently running source status fetches.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: NotebookCall) {
        lock(&self.state).calls.push(call);
    }

    fn next_job_id(&self, prefix: &str) -> JobId {
        let mut state = lock(&self.state);
        state.jobs_issued += 1;
        JobId::from(format!("{prefix}:{}", state.jobs_issued))
    }
}

fn source_job_id(source_ref: &SourceRef) -> JobId {
    JobId::from(format!("source:{source_ref}"))
}

#[async_trait]
impl NotebookBoundary for FakeNotebook {
    async fn create_batch(&self, name: &str, description: &str) -> Result<String, RemoteError> {
        self.record(NotebookCall::CreateBatch {
            name: name.to_string(),
            description: description.to_string(),
        });
        Ok("notebook:1".to_string())
    }

    async fn submit_source(
        &self,
        _batch_id: &str,
        submission: &SourceSubmission,
    ) -> Result<JobId, RemoteError> {
        self.record(NotebookCall::SubmitSource {
            source_ref: submission.source_ref.clone(),
            idempotency_key: submission.idempotency_key.clone(),
            as_text: matches!(submission.payload, SubmissionPayload::Text { .. }),
        });
        let mut state = lock(&self.state);
        if state.rejected.contains(&submission.source_ref) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("cannot ingest {}", submission.source_ref),
            });
        }
        if let Some(job) = state.submissions.get(&submission.idempotency_key) {
            return Ok(job.clone());
        }
        let job = source_job_id(&submission.source_ref);
        state
            .job_sources
            .insert(job.clone(), submission.source_ref.clone());
        state
            .submissions
            .insert(submission.idempotency_key.clone(), job.clone());
        Ok(job)
    }

    async fn fetch_source_status(&self, job: &JobId) -> Result<RemoteStatus, RemoteError> {
        self.record(NotebookCall::SourceStatus { job: job.clone() });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = {
            let mut state = lock(&self.state);
            let source_ref = state.job_sources.get(job).cloned();
            match source_ref {
                None => Err(RemoteError::Rejected {
                    status: 404,
                    message: format!("unknown source {job}"),
                }),
                Some(source_ref) => {
                    let default = state.default_source.clone();
                    state
                        .source_scripts
                        .entry(source_ref)
                        .or_insert_with(|| Script::new(default))
                        .next()
                }
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn trigger_text_synthesis(&self, batch_id: &str) -> Result<JobId, RemoteError> {
        self.record(NotebookCall::TriggerText {
            batch_id: batch_id.to_string(),
        });
        if lock(&self.state).reject_text_trigger {
            return Err(RemoteError::rejected("summary generation disabled"));
        }
        Ok(self.next_job_id("text"))
    }

    async fn trigger_audio_synthesis(
        &self,
        request: &AudioRequest,
    ) -> Result<JobId, RemoteError> {
        self.record(NotebookCall::TriggerAudio {
            episode_name: request.episode_name.clone(),
        });
        Ok(self.next_job_id("audio"))
    }

    async fn fetch_job_status(
        &self,
        kind: GenerationKind,
        _job: &JobId,
    ) -> Result<RemoteStatus, RemoteError> {
        self.record(NotebookCall::JobStatus { kind });
        let mut state = lock(&self.state);
        match kind {
            GenerationKind::SynthesisText => state.text_script.next(),
            GenerationKind::SynthesisAudio => state.audio_script.next(),
        }
    }

    async fn fetch_artifact(&self, result_ref: &str) -> Result<Vec<u8>, RemoteError> {
        self.record(NotebookCall::FetchArtifact {
            result_ref: result_ref.to_string(),
        });
        lock(&self.state).artifact.clone().ok_or_else(|| RemoteError::Rejected {
            status: 404,
            message: format!("no audio for {result_ref}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryUploader {
    files: Mutex<HashMap<String, Vec<u8>>>,
    failure: Option<String>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.files).keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl AudioUploader for MemoryUploader {
    async fn upload(&self, bytes: &[u8], filename: &str) -> Result<String, RemoteError> {
        if let Some(reason) = &self.failure {
            return Err(RemoteError::Transient(reason.clone()));
        }
        lock(&self.files).insert(filename.to_string(), bytes.to_vec());
        Ok(format!("memory://audio/{filename}"))
    }
}
