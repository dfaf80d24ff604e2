//! Bounded-concurrency poller for remote asynchronous jobs.
//!
//! One [`RemoteJobPoller`] drives any set of job handles to a terminal
//! state through a [`StatusFetcher`]. It backs both the wait for source
//! ingestion (many handles, short timeout) and the wait for each synthesis
//! job (one handle, long timeout).
//!
//! # Round structure
//!
//! ```text
//! expire overdue handles ─► fetch pending (≤ K in flight) ─► classify
//!        ▲                                                      │
//!        └──── sleep(interval | backoff, clamped to deadline) ◄─┘
//! ```
//!
//! - Each handle's timeout runs from its own registration instant.
//! - Consecutive transient fetch errors back the interval off
//!   exponentially (capped at `max_interval`); a handle whose consecutive
//!   transient errors exceed `error_budget` fails as remote-unavailable.
//! - The whole call is bounded by `max(deadline) + interval`.
//! - Cancellation is observed both while fetching and while sleeping.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use digest_core::{GenerationKind, JobId};
use digest_remote::{NotebookBoundary, RemoteError, RemoteStatus};

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Status-fetch capability the poller is parameterised over.
#[async_trait]
pub trait StatusFetcher<H: Sync>: Send + Sync {
    async fn fetch(&self, handle: &H) -> Result<RemoteStatus, RemoteError>;
}

/// Source ingestion status on the notebook service.
pub struct SourceStatus<'a>(pub &'a dyn NotebookBoundary);

#[async_trait]
impl StatusFetcher<JobId> for SourceStatus<'_> {
    async fn fetch(&self, handle: &JobId) -> Result<RemoteStatus, RemoteError> {
        self.0.fetch_source_status(handle).await
    }
}

/// Synthesis job status on the notebook service.
pub struct GenerationStatus<'a> {
    pub notebook: &'a dyn NotebookBoundary,
    pub kind: GenerationKind,
}

#[async_trait]
impl StatusFetcher<JobId> for GenerationStatus<'_> {
    async fn fetch(&self, handle: &JobId) -> Result<RemoteStatus, RemoteError> {
        self.notebook.fetch_job_status(self.kind, handle).await
    }
}

// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Floor applied to [`PollConfig::interval`].
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between rounds while no transient errors occur. Never below
    /// [`MIN_INTERVAL`].
    pub interval: Duration,
    /// Upper bound of the backed-off interval.
    pub max_interval: Duration,
    /// Maximum in-flight status fetches.
    pub concurrency: usize,
    /// Per-handle budget, measured from registration.
    pub timeout: Duration,
    /// Consecutive transient errors tolerated per handle.
    pub error_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The remote service reported the job as failed.
    Remote(String),
    /// A status fetch was refused outright.
    Rejected(String),
    /// Transient fetch errors exhausted the error budget.
    RemoteUnavailable { errors: u32, last: String },
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::Remote(reason) => write!(f, "remote failure: {reason}"),
            FailReason::Rejected(reason) => write!(f, "status fetch rejected: {reason}"),
            FailReason::RemoteUnavailable { errors, last } => {
                write!(f, "RemoteUnavailable after {errors} consecutive errors: {last}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Terminal success, with the remote result reference if any.
    Completed(Option<String>),
    Failed(FailReason),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Status fetches issued for this handle.
    pub polls: u32,
    pub finished_at: Instant,
}

/// Polling was interrupted by the cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

struct Tracked<H> {
    handle: H,
    deadline: Instant,
    polls: u32,
    consecutive_errors: u32,
    report: Option<PollReport>,
}

impl<H> Tracked<H> {
    fn finish(&mut self, outcome: PollOutcome, at: Instant) {
        self.report = Some(PollReport {
            outcome,
            polls: self.polls,
            finished_at: at,
        });
    }

    fn is_pending(&self) -> bool {
        self.report.is_none()
    }
}

pub struct RemoteJobPoller<H> {
    config: PollConfig,
    jobs: Vec<Tracked<H>>,
}

impl<H> RemoteJobPoller<H>
where
    H: Clone + Eq + Hash + fmt::Debug + Send + Sync,
{
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
        }
    }

    /// Register `handle` now; its timeout starts immediately.
    pub fn register(&mut self, handle: H) {
        self.register_at(handle, Instant::now());
    }

    /// Register `handle` as of `registered_at` (typically its submission
    /// instant). Registering the same handle twice keeps the first entry.
    pub fn register_at(&mut self, handle: H, registered_at: Instant) {
        if self.jobs.iter().any(|j| j.handle == handle) {
            return;
        }
        self.jobs.push(Tracked {
            handle,
            deadline: registered_at + self.config.timeout,
            polls: 0,
            consecutive_errors: 0,
            report: None,
        });
    }

    /// Poll every registered handle to a terminal state.
    pub async fn run<F>(
        mut self,
        fetcher: &F,
        cancel: &CancellationToken,
    ) -> Result<HashMap<H, PollReport>, Cancelled>
    where
        F: StatusFetcher<H> + ?Sized,
    {
        let Some(last_deadline) = self.jobs.iter().map(|j| j.deadline).max() else {
            return Ok(HashMap::new());
        };
        let interval = self.config.interval.max(MIN_INTERVAL);
        let ceiling = last_deadline + interval;
        let concurrency = self.config.concurrency.max(1);
        let mut delay = interval;

        loop {
            let now = Instant::now();
            self.expire(now);

            let pending: Vec<usize> = (0..self.jobs.len())
                .filter(|&i| self.jobs[i].is_pending())
                .collect();
            if pending.is_empty() {
                break;
            }

            let jobs = &self.jobs;
            let fetches: Vec<_> = pending
                .iter()
                .map(|&i| {
                    let handle = &jobs[i].handle;
                    async move { (i, fetcher.fetch(handle).await) }
                })
                .collect();
            let round = stream::iter(fetches)
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>();

            let results = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                fetched = timeout_at(ceiling, round) => match fetched {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::warn!(pending = pending.len(), "poll ceiling reached mid-round");
                        self.expire_all(Instant::now());
                        break;
                    }
                },
            };

            let fetched_at = Instant::now();
            let mut transient = false;
            for (i, result) in results {
                transient |= self.classify(i, result, fetched_at);
            }

            let Some(next_deadline) = self
                .jobs
                .iter()
                .filter(|j| j.is_pending())
                .map(|j| j.deadline)
                .min()
            else {
                break;
            };

            delay = if transient {
                (delay * 2).min(self.config.max_interval.max(interval))
            } else {
                interval
            };
            let wake = (fetched_at + delay).min(next_deadline).min(ceiling);
            tracing::debug!(
                pending = pending.len(),
                delay_ms = delay.as_millis() as u64,
                "poll round complete"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = sleep_until(wake) => {}
            }
            if Instant::now() >= ceiling {
                self.expire_all(Instant::now());
                break;
            }
        }

        Ok(self
            .jobs
            .into_iter()
            .filter_map(|j| j.report.map(|report| (j.handle, report)))
            .collect())
    }

    /// Apply one fetch result. Returns whether it was a transient error.
    fn classify(
        &mut self,
        i: usize,
        result: Result<RemoteStatus, RemoteError>,
        at: Instant,
    ) -> bool {
        let budget = self.config.error_budget;
        let job = &mut self.jobs[i];
        job.polls += 1;
        match result {
            Ok(RemoteStatus::Pending) => {
                job.consecutive_errors = 0;
                false
            }
            Ok(RemoteStatus::Done(result_ref)) => {
                job.finish(PollOutcome::Completed(result_ref), at);
                false
            }
            Ok(RemoteStatus::Failed(reason)) => {
                job.finish(PollOutcome::Failed(FailReason::Remote(reason)), at);
                false
            }
            Err(err) if err.is_transient() => {
                job.consecutive_errors += 1;
                tracing::warn!(
                    handle = ?job.handle,
                    errors = job.consecutive_errors,
                    error = %err,
                    "transient status fetch failure"
                );
                if job.consecutive_errors > budget {
                    let reason = FailReason::RemoteUnavailable {
                        errors: job.consecutive_errors,
                        last: err.to_string(),
                    };
                    job.finish(PollOutcome::Failed(reason), at);
                }
                true
            }
            Err(err) => {
                job.finish(PollOutcome::Failed(FailReason::Rejected(err.to_string())), at);
                false
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        for job in self.jobs.iter_mut().filter(|j| j.is_pending()) {
            if now >= job.deadline {
                tracing::debug!(handle = ?job.handle, polls = job.polls, "job timed out");
                job.finish(PollOutcome::TimedOut, now);
            }
        }
    }

    fn expire_all(&mut self, now: Instant) {
        for job in self.jobs.iter_mut().filter(|j| j.is_pending()) {
            job.finish(PollOutcome::TimedOut, now);
        }
    }
}
