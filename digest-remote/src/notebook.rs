//! Notebook and generation adapter for the Open Notebook REST API.
//!
//! ```text
//! POST /api/notebooks                       create batch
//! POST /api/sources                         submit source (form, async)
//! GET  /api/sources/{id}/status             source ingestion status
//! POST /api/notebooks/{id}/summary          trigger text synthesis
//! GET  /api/commands/jobs/{id}              text synthesis status
//! POST /api/podcasts/generate               trigger audio synthesis
//! GET  /api/podcasts/jobs/{id}              audio synthesis status
//! GET  /api/podcasts/episodes/{id}/audio    audio artifact bytes
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use digest_core::config::NotebookSettings;
use digest_core::{GenerationKind, JobId};

use crate::boundary::{AudioRequest, NotebookBoundary, RemoteStatus, SourceSubmission, SubmissionPayload};
use crate::error::RemoteError;
use crate::http;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct OpenNotebookClient {
    client: reqwest::Client,
    base_url: String,
    password: String,
}

#[derive(Serialize)]
struct CreateNotebook<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Serialize)]
struct GeneratePodcast<'a> {
    notebook_id: &'a str,
    episode_name: &'a str,
    episode_profile: &'a str,
    speaker_profile: &'a str,
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct JobAccepted {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    episode_id: Option<String>,
    #[serde(default)]
    note_id: Option<String>,
    #[serde(default, alias = "message")]
    error_message: Option<String>,
}

impl StatusBody {
    fn into_status(self, kind: Option<GenerationKind>) -> RemoteStatus {
        let result_ref = match kind {
            Some(GenerationKind::SynthesisAudio) => self.episode_id,
            Some(GenerationKind::SynthesisText) => self.note_id,
            None => None,
        };
        RemoteStatus::from_status_word(&self.status, result_ref, self.error_message)
    }
}

impl OpenNotebookClient {
    pub fn new(settings: &NotebookSettings, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: http::client(timeout)?,
            base_url: settings.url.clone(),
            password: settings.password.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(http::join(&self.base_url, path))
            .bearer_auth(&self.password)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(http::join(&self.base_url, path))
            .bearer_auth(&self.password)
    }

    async fn status(&self, path: &str, kind: Option<GenerationKind>) -> Result<RemoteStatus, RemoteError> {
        let body: StatusBody = http::send(self.get(path)).await?.json().await?;
        Ok(body.into_status(kind))
    }
}

/// Form fields for a source submission.
fn source_form(batch_id: &str, payload: &SubmissionPayload) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("notebooks", format!("[\"{batch_id}\"]")),
        ("embed", "true".to_string()),
        ("async_processing", "true".to_string()),
    ];
    match payload {
        SubmissionPayload::Url(url) => {
            form.push(("type", "link".to_string()));
            form.push(("url", url.clone()));
        }
        SubmissionPayload::Text { title, content } => {
            form.push(("type", "text".to_string()));
            form.push(("content", content.clone()));
            if let Some(title) = title {
                form.push(("title", title.clone()));
            }
        }
    }
    form
}

#[async_trait]
impl NotebookBoundary for OpenNotebookClient {
    async fn create_batch(&self, name: &str, description: &str) -> Result<String, RemoteError> {
        let request = self
            .post("/api/notebooks")
            .json(&CreateNotebook { name, description });
        let created: Created = http::send(request).await?.json().await?;
        tracing::info!(notebook_id = %created.id, name, "notebook created");
        Ok(created.id)
    }

    async fn submit_source(
        &self,
        batch_id: &str,
        submission: &SourceSubmission,
    ) -> Result<JobId, RemoteError> {
        let request = self
            .post("/api/sources")
            .header(IDEMPOTENCY_HEADER, &submission.idempotency_key)
            .form(&source_form(batch_id, &submission.payload));
        let created: Created = http::send(request).await?.json().await?;
        tracing::debug!(
            source_ref = %submission.source_ref,
            source_id = %created.id,
            "source submitted"
        );
        Ok(JobId::from(created.id))
    }

    async fn fetch_source_status(&self, job: &JobId) -> Result<RemoteStatus, RemoteError> {
        self.status(&format!("/api/sources/{job}/status"), None).await
    }

    async fn trigger_text_synthesis(&self, batch_id: &str) -> Result<JobId, RemoteError> {
        let request = self.post(&format!("/api/notebooks/{batch_id}/summary"));
        let accepted: JobAccepted = http::send(request).await?.json().await?;
        tracing::info!(job_id = %accepted.job_id, notebook_id = batch_id, "text synthesis started");
        Ok(JobId::from(accepted.job_id))
    }

    async fn trigger_audio_synthesis(
        &self,
        request: &AudioRequest,
    ) -> Result<JobId, RemoteError> {
        let body = GeneratePodcast {
            notebook_id: &request.batch_id,
            episode_name: &request.episode_name,
            episode_profile: &request.episode_profile,
            speaker_profile: &request.speaker_profile,
        };
        let accepted: JobAccepted = http::send(self.post("/api/podcasts/generate").json(&body))
            .await?
            .json()
            .await?;
        tracing::info!(
            job_id = %accepted.job_id,
            episode_name = %request.episode_name,
            "audio synthesis started"
        );
        Ok(JobId::from(accepted.job_id))
    }

    async fn fetch_job_status(
        &self,
        kind: GenerationKind,
        job: &JobId,
    ) -> Result<RemoteStatus, RemoteError> {
        let path = match kind {
            GenerationKind::SynthesisText => format!("/api/commands/jobs/{job}"),
            GenerationKind::SynthesisAudio => format!("/api/podcasts/jobs/{job}"),
        };
        self.status(&path, Some(kind)).await
    }

    async fn fetch_artifact(&self, result_ref: &str) -> Result<Vec<u8>, RemoteError> {
        let path = format!("/api/podcasts/episodes/{result_ref}/audio");
        let bytes = http::send(self.get(&path)).await?.bytes().await?;
        tracing::info!(episode_id = result_ref, size = bytes.len(), "episode audio downloaded");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_submission_form() {
        let form = source_form("nb-1", &SubmissionPayload::Url("https://example.org".into()));
        assert!(form.contains(&("notebooks", "[\"nb-1\"]".to_string())));
        assert!(form.contains(&("type", "link".to_string())));
        assert!(form.contains(&("url", "https://example.org".to_string())));
        assert!(form.contains(&("async_processing", "true".to_string())));
    }

    #[test]
    fn text_submission_form_carries_title() {
        let payload = SubmissionPayload::Text {
            title: Some("Paper".into()),
            content: "# Body".into(),
        };
        let form = source_form("nb-1", &payload);
        assert!(form.contains(&("type", "text".to_string())));
        assert!(form.contains(&("content", "# Body".to_string())));
        assert!(form.contains(&("title", "Paper".to_string())));
    }

    #[test]
    fn audio_status_yields_episode_id() {
        let body: StatusBody =
            serde_json::from_str(r#"{"status": "completed", "episode_id": "episode:42"}"#).unwrap();
        assert_eq!(
            body.into_status(Some(GenerationKind::SynthesisAudio)),
            RemoteStatus::Done(Some("episode:42".into()))
        );
    }

    #[test]
    fn failed_status_keeps_remote_message() {
        let body: StatusBody =
            serde_json::from_str(r#"{"status": "error", "message": "embedding failed"}"#).unwrap();
        assert_eq!(
            body.into_status(None),
            RemoteStatus::Failed("embedding failed".into())
        );
    }

    #[test]
    fn missing_status_is_pending() {
        let body: StatusBody = serde_json::from_str("{}").unwrap();
        assert_eq!(body.into_status(None), RemoteStatus::Pending);
    }
}
