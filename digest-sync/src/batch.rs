//! Turns the week's archive items into remote source submissions.

use tokio::time::Instant;

use digest_core::{ItemState, JobId, Ledger, LedgerError, RunId, SourceItem, SourceRef};
use digest_remote::{
    ArchiveBoundary, ArchiveItem, NotebookBoundary, SourceSubmission, SubmissionPayload,
};

/// An item the notebook accepted, with the instant its ingestion clock
/// started.
#[derive(Debug, Clone)]
pub struct SubmittedItem {
    pub item: SourceItem,
    pub job_id: JobId,
    pub submitted_at: Instant,
}

#[derive(Debug, Default)]
pub struct BatchSubmission {
    pub accepted: Vec<SubmittedItem>,
    /// Items refused at submission; already recorded as failed.
    pub rejected: Vec<SourceRef>,
}

pub struct BatchBuilder<'a> {
    archive: &'a dyn ArchiveBoundary,
    notebook: &'a dyn NotebookBoundary,
    ledger: &'a Ledger,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(
        archive: &'a dyn ArchiveBoundary,
        notebook: &'a dyn NotebookBoundary,
        ledger: &'a Ledger,
    ) -> Self {
        Self {
            archive,
            notebook,
            ledger,
        }
    }

    /// Submit every item to `batch_id`.
    ///
    /// A refused submission marks that item failed and the batch carries
    /// on; only ledger errors abort.
    pub async fn submit(
        &self,
        run_id: RunId,
        batch_id: &str,
        items: &[ArchiveItem],
    ) -> Result<BatchSubmission, LedgerError> {
        let mut submission = BatchSubmission::default();

        for archive_item in items {
            let mut item = SourceItem::new(archive_item.source_ref.clone());
            let payload = self.payload_for(archive_item).await;
            let request = SourceSubmission::new(run_id, item.source_ref.clone(), payload);
            item.attempts = 1;

            match self.notebook.submit_source(batch_id, &request).await {
                Ok(job_id) => {
                    item.state = ItemState::Submitted;
                    item.remote_job_id = Some(job_id.clone());
                    self.ledger.record_item_outcome(run_id, &item, None)?;
                    tracing::debug!(
                        run_id = %run_id,
                        source_ref = %item.source_ref,
                        job_id = %job_id,
                        "source submitted"
                    );
                    submission.accepted.push(SubmittedItem {
                        item,
                        job_id,
                        submitted_at: Instant::now(),
                    });
                }
                Err(err) => {
                    item.state = ItemState::Failed;
                    let detail = format!("submission refused: {err}");
                    self.ledger.record_item_outcome(run_id, &item, Some(&detail))?;
                    tracing::warn!(
                        run_id = %run_id,
                        source_ref = %item.source_ref,
                        error = %err,
                        "source submission failed"
                    );
                    submission.rejected.push(item.source_ref);
                }
            }
        }

        tracing::info!(
            run_id = %run_id,
            accepted = submission.accepted.len(),
            rejected = submission.rejected.len(),
            "batch submitted"
        );
        Ok(submission)
    }

    /// Browsable items go by URL. Others are sent as extracted text when
    /// the archive has any, falling back to the URL.
    async fn payload_for(&self, item: &ArchiveItem) -> SubmissionPayload {
        if item.is_browsable() {
            return SubmissionPayload::Url(item.url.clone());
        }
        match self.archive.fetch_extracted_text(item).await {
            Ok(Some(content)) => SubmissionPayload::Text {
                title: item.title.clone(),
                content,
            },
            Ok(None) => SubmissionPayload::Url(item.url.clone()),
            Err(err) => {
                tracing::warn!(
                    source_ref = %item.source_ref,
                    error = %err,
                    "content extraction failed, submitting URL"
                );
                SubmissionPayload::Url(item.url.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use digest_remote::fake::{FakeArchive, FakeNotebook, NotebookCall};

    use super::*;

    fn pdf(source_ref: &str) -> ArchiveItem {
        ArchiveItem::new(source_ref, format!("https://example.org/{source_ref}.pdf"))
    }

    #[tokio::test]
    async fn rejected_item_is_recorded_and_batch_continues() {
        let ledger = Ledger::open_in_memory().unwrap();
        let run = ledger.begin_run(3).unwrap();
        let archive = FakeArchive::with_items(3);
        let notebook = FakeNotebook::new().reject_source("item-1");
        let items = archive.list_weekly_items().await.unwrap();

        let builder = BatchBuilder::new(&archive, &notebook, &ledger);
        let submission = builder.submit(run.id, "notebook:1", &items).await.unwrap();

        assert_eq!(submission.accepted.len(), 2);
        assert_eq!(submission.rejected, vec![SourceRef::from("item-1")]);
        let outcomes = ledger.item_outcomes(run.id).unwrap();
        assert_eq!(outcomes.len(), 3);
        let rejected = outcomes
            .iter()
            .find(|o| o.source_ref == SourceRef::from("item-1"))
            .unwrap();
        assert_eq!(rejected.state, ItemState::Failed);
        assert!(rejected.detail.as_deref().unwrap().contains("submission refused"));
    }

    #[tokio::test]
    async fn non_browsable_items_use_extracted_text_when_available() {
        let ledger = Ledger::open_in_memory().unwrap();
        let run = ledger.begin_run(2).unwrap();
        let archive = FakeArchive::new(vec![pdf("with-text"), pdf("no-text")])
            .with_text("with-text", "# Extracted");
        let notebook = FakeNotebook::new();
        let items = archive.list_weekly_items().await.unwrap();

        BatchBuilder::new(&archive, &notebook, &ledger)
            .submit(run.id, "notebook:1", &items)
            .await
            .unwrap();

        let as_text: Vec<(SourceRef, bool)> = notebook
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                NotebookCall::SubmitSource { source_ref, as_text, .. } => Some((source_ref, as_text)),
                _ => None,
            })
            .collect();
        assert_eq!(
            as_text,
            vec![
                (SourceRef::from("with-text"), true),
                (SourceRef::from("no-text"), false),
            ]
        );
        assert_eq!(archive.text_fetches().len(), 2);
    }

    #[tokio::test]
    async fn browsable_items_skip_extraction() {
        let ledger = Ledger::open_in_memory().unwrap();
        let run = ledger.begin_run(2).unwrap();
        let archive = FakeArchive::with_items(2);
        let notebook = FakeNotebook::new();
        let items = archive.list_weekly_items().await.unwrap();

        BatchBuilder::new(&archive, &notebook, &ledger)
            .submit(run.id, "notebook:1", &items)
            .await
            .unwrap();
        assert!(archive.text_fetches().is_empty());
    }
}
