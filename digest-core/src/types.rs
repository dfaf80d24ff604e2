//! Domain types for the weekly digest pipeline.
//!
//! Every status enum has a stable lowercase string form; it is used both by
//! serde and by the ledger's SQLite columns, so the two never drift apart.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Ledger-assigned identifier of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RunId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque identifier of a content item in the bookmark archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef(pub String);

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SourceRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of an asynchronous job on the notebook service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Returned when a persisted status string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares `as_str`, `Display` and `FromStr` for a fieldless enum from a
/// single variant/string table.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

/// Lifecycle of one weekly batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
    Failed => "failed",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Last stage transition recorded for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Submitting,
    AwaitingIngestion,
    TextSynthesis,
    AudioSynthesis,
    Publishing,
    Finished,
}

string_enum!(RunStage, "run stage", {
    Fetching => "fetching",
    Submitting => "submitting",
    AwaitingIngestion => "awaiting_ingestion",
    TextSynthesis => "text_synthesis",
    AudioSynthesis => "audio_synthesis",
    Publishing => "publishing",
    Finished => "finished",
});

/// Progress of one source item through submission and remote ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Pending,
    Submitted,
    Ingested,
    Failed,
    TimedOut,
}

string_enum!(ItemState, "item state", {
    Pending => "pending",
    Submitted => "submitted",
    Ingested => "ingested",
    Failed => "failed",
    TimedOut => "timed_out",
});

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Ingested | ItemState::Failed | ItemState::TimedOut
        )
    }
}

/// Which remote synthesis stage a generation job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    SynthesisText,
    SynthesisAudio,
}

string_enum!(GenerationKind, "generation kind", {
    SynthesisText => "synthesis_text",
    SynthesisAudio => "synthesis_audio",
});

/// State of a remote generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Submitted,
    Polling,
    Completed,
    Failed,
    TimedOut,
}

string_enum!(GenerationState, "generation state", {
    Submitted => "submitted",
    Polling => "polling",
    Completed => "completed",
    Failed => "failed",
    TimedOut => "timed_out",
});

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// One weekly cycle as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stage: RunStage,
    pub item_count: u32,
    /// Remote notebook the run's sources were submitted to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub counts: OutcomeCounts,
}

/// Aggregate of per-item terminal states for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub ingested: u32,
    pub failed: u32,
    pub timed_out: u32,
}

impl OutcomeCounts {
    pub fn total(&self) -> u32 {
        self.ingested + self.failed + self.timed_out
    }

    pub fn add(&mut self, state: ItemState) {
        match state {
            ItemState::Ingested => self.ingested += 1,
            ItemState::Failed => self.failed += 1,
            ItemState::TimedOut => self.timed_out += 1,
            ItemState::Pending | ItemState::Submitted => {}
        }
    }
}

/// One content item moving through a run. Lives only for the duration of
/// the run; its terminal state is persisted as an [`ItemOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub source_ref: SourceRef,
    pub remote_job_id: Option<JobId>,
    pub state: ItemState,
    pub attempts: u32,
}

impl SourceItem {
    pub fn new(source_ref: SourceRef) -> Self {
        Self {
            source_ref,
            remote_job_id: None,
            state: ItemState::Pending,
            attempts: 0,
        }
    }
}

/// Persisted per-item outcome row, keyed by `(run_id, source_ref)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub run_id: RunId,
    pub source_ref: SourceRef,
    pub state: ItemState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One remote synthesis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: JobId,
    pub kind: GenerationKind,
    pub state: GenerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    pub poll_count: u32,
}

/// A produced audio artifact. Outlives the run that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub batch_run_id: RunId,
    pub artifact_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
