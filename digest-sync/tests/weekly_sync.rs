//! End-to-end runs of the weekly sync against in-memory boundaries.

use std::sync::Arc;
use std::time::Duration;

use digest_core::{GenerationKind, GenerationState, ItemState, Ledger, RunStatus};
use digest_remote::fake::{FakeArchive, FakeNotebook, MemoryUploader, NotebookCall, Step};
use digest_remote::ArchiveItem;
use digest_sync::{SyncError, SyncOptions, WeeklySyncOrchestrator};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

struct Harness {
    ledger: Arc<Ledger>,
    archive: Arc<FakeArchive>,
    notebook: Arc<FakeNotebook>,
    uploader: Arc<MemoryUploader>,
    orchestrator: WeeklySyncOrchestrator,
}

fn options() -> SyncOptions {
    SyncOptions {
        stale_after: None,
        ..SyncOptions::default()
    }
}

fn harness_with(
    archive: FakeArchive,
    notebook: FakeNotebook,
    uploader: MemoryUploader,
    options: SyncOptions,
) -> Harness {
    let ledger = Arc::new(Ledger::open_in_memory().expect("ledger"));
    let archive = Arc::new(archive);
    let notebook = Arc::new(notebook);
    let uploader = Arc::new(uploader);
    let orchestrator = WeeklySyncOrchestrator::new(
        ledger.clone(),
        archive.clone(),
        notebook.clone(),
        options,
    )
    .with_uploader(uploader.clone());
    Harness {
        ledger,
        archive,
        notebook,
        uploader,
        orchestrator,
    }
}

fn harness(archive: FakeArchive, notebook: FakeNotebook) -> Harness {
    harness_with(archive, notebook, MemoryUploader::new(), options())
}

// ---------------------------------------------------------------------------
// 1. Empty weeks and single-flight
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_week_completes_without_generation() {
    let h = harness(FakeArchive::with_items(0), FakeNotebook::new());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.item_count, 0);
    assert!(summary.error.is_none());
    assert!(h.notebook.calls().is_empty(), "calls: {:?}", h.notebook.calls());
    assert!(h.ledger.running_run().expect("running").is_none());
}

#[tokio::test(start_paused = true)]
async fn second_trigger_while_running_has_no_side_effects() {
    let h = harness(FakeArchive::with_items(3), FakeNotebook::new());
    let active = h.ledger.begin_run(0).expect("begin");

    let err = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, SyncError::AlreadyRunning { run_id } if run_id == active.id),
        "got: {err}"
    );
    assert_eq!(h.archive.list_calls(), 0);
    assert!(h.notebook.calls().is_empty());
    assert_eq!(h.ledger.run_history(10).expect("history").len(), 1);
}

// ---------------------------------------------------------------------------
// 2. Ingestion policies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_of_five_failures_complete_with_errors() {
    let notebook = FakeNotebook::new()
        .reject_source("item-1")
        .source_script("item-3", vec![Step::pending(), Step::failed("unreadable")]);
    let h = harness(FakeArchive::with_items(5), notebook);

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    assert_eq!(summary.item_count, 5);
    assert_eq!(summary.counts.ingested, 3);
    assert_eq!(summary.counts.failed, 2);
    let error = summary.error.expect("error");
    assert!(error.contains("2 of 5 items failed"), "error: {error}");
    assert!(h.notebook.audio_triggered());

    let episode = summary.episode.expect("episode");
    assert!(episode.uploaded);
    assert_eq!(h.uploader.filenames().len(), 1);
    assert!(h.uploader.filenames()[0].starts_with("episode_1_"));
}

#[tokio::test(start_paused = true)]
async fn zero_ingested_items_fail_before_generation() {
    let notebook = FakeNotebook::new().default_source_script(vec![Step::failed("bad")]);
    let h = harness(FakeArchive::with_items(3), notebook);

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.as_deref().unwrap_or("").contains("AllItemsFailed"));
    assert_eq!(h.notebook.generation_calls(), 0);
    assert!(h.ledger.latest_episodes(10).expect("episodes").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_items_time_out_and_count_as_failures() {
    let notebook = FakeNotebook::new().source_script("item-0", vec![Step::pending()]);
    let h = harness(FakeArchive::with_items(2), notebook);

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    assert_eq!(summary.counts.timed_out, 1);
    let outcomes = h.ledger.item_outcomes(summary.run_id).expect("outcomes");
    let slow = outcomes
        .iter()
        .find(|o| o.source_ref.0 == "item-0")
        .expect("slow item");
    assert_eq!(slow.state, ItemState::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn duplicate_listings_are_submitted_once() {
    let archive = FakeArchive::new(vec![
        ArchiveItem::new("bm-1", "https://example.org/1"),
        ArchiveItem::new("bm-1", "https://example.org/1"),
        ArchiveItem::new("bm-2", "https://example.org/2"),
    ]);
    let h = harness(archive, FakeNotebook::new());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.item_count, 2);
    assert_eq!(summary.counts.ingested, 2);
    assert_eq!(summary.counts.total(), summary.item_count);
    let outcomes = h.ledger.item_outcomes(summary.run_id).expect("outcomes");
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.state == ItemState::Ingested));
    let submissions = h
        .notebook
        .calls()
        .iter()
        .filter(|c| matches!(c, NotebookCall::SubmitSource { .. }))
        .count();
    assert_eq!(submissions, 2);
}

#[rstest]
#[case::all_good(FakeNotebook::new())]
#[case::one_rejected(FakeNotebook::new().reject_source("item-2"))]
#[case::flaky(FakeNotebook::new().default_source_script(vec![Step::Transient, Step::done()]))]
#[case::text_fails(FakeNotebook::new().text_script(vec![Step::failed("quota")]))]
#[case::all_fail(FakeNotebook::new().default_source_script(vec![Step::failed("x")]))]
#[tokio::test(start_paused = true)]
async fn terminal_outcomes_sum_to_item_count(#[case] notebook: FakeNotebook) {
    let h = harness(FakeArchive::with_items(4), notebook);

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert!(summary.status.is_terminal());
    assert_eq!(summary.counts.total(), summary.item_count);
    let outcomes = h.ledger.item_outcomes(summary.run_id).expect("outcomes");
    assert_eq!(outcomes.len() as u32, summary.item_count);
    assert!(outcomes.iter().all(|o| o.state.is_terminal()));
}

// ---------------------------------------------------------------------------
// 3. Generation and publishing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn text_synthesis_failure_fails_run_without_audio() {
    let notebook = FakeNotebook::new().text_script(vec![Step::failed("model unavailable")]);
    let h = harness(FakeArchive::with_items(2), notebook);

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(!h.notebook.audio_triggered());
    let error = summary.error.expect("error");
    assert!(error.contains("text synthesis failed"), "error: {error}");
    assert!(summary.episode.is_none());
}

#[tokio::test(start_paused = true)]
async fn refused_text_trigger_fails_run_without_audio() {
    let h = harness(FakeArchive::with_items(2), FakeNotebook::new().reject_text_trigger());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Failed);
    let error = summary.error.expect("error");
    assert!(error.contains("text synthesis failed: trigger refused"), "error: {error}");
    assert!(!h.notebook.audio_triggered());
    assert!(summary.episode.is_none());
    assert!(h.ledger.generation_jobs(summary.run_id).expect("jobs").is_empty());
}

#[rstest]
#[case::remote_failure(vec![Step::failed("tts crashed")], GenerationState::Failed)]
#[case::timeout(vec![Step::pending()], GenerationState::TimedOut)]
#[tokio::test(start_paused = true)]
async fn audio_failure_fails_run_without_episode(
    #[case] audio: Vec<Step>,
    #[case] expected: GenerationState,
) {
    let h = harness(FakeArchive::with_items(2), FakeNotebook::new().audio_script(audio));

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Failed);
    let error = summary.error.expect("error");
    assert!(error.contains("audio synthesis failed"), "error: {error}");
    assert!(summary.episode.is_none());
    assert!(h.ledger.latest_episodes(5).expect("episodes").is_empty());
    assert!(h.uploader.filenames().is_empty());

    let jobs = h.ledger.generation_jobs(summary.run_id).expect("jobs");
    let audio_job = jobs
        .iter()
        .find(|j| j.kind == GenerationKind::SynthesisAudio)
        .expect("audio job");
    assert_eq!(audio_job.state, expected);
}

#[tokio::test(start_paused = true)]
async fn missing_artifact_keeps_episode_unpublished() {
    let h = harness(FakeArchive::with_items(1), FakeNotebook::new().without_artifact());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    let error = summary.error.expect("error");
    assert!(error.contains("audio download failed"), "error: {error}");
    let episode = summary.episode.expect("episode");
    assert!(!episode.uploaded);
    assert!(episode.public_url.is_none());
    assert!(h.uploader.filenames().is_empty());
    let episodes = h.ledger.latest_episodes(5).expect("episodes");
    assert_eq!(episodes.len(), 1);
    assert!(!episodes[0].uploaded);
}

#[tokio::test(start_paused = true)]
async fn clean_run_publishes_episode() {
    let h = harness(FakeArchive::with_items(2), FakeNotebook::new());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.error.is_none());
    let episodes = h.orchestrator.latest_episodes(5).expect("episodes");
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].artifact_ref, "episode:1");
    assert!(episodes[0].uploaded);
    assert!(episodes[0]
        .public_url
        .as_deref()
        .unwrap_or("")
        .starts_with("memory://audio/episode_1_"));
    let run = h.ledger.get_run(summary.run_id).expect("get").expect("run");
    assert_eq!(run.batch_ref.as_deref(), Some("notebook:1"));
}

#[tokio::test(start_paused = true)]
async fn upload_failure_keeps_episode_and_reports_error() {
    let h = harness_with(
        FakeArchive::with_items(1),
        FakeNotebook::new(),
        MemoryUploader::failing("bucket offline"),
        options(),
    );

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::CompletedWithErrors);
    assert!(summary.error.as_deref().unwrap_or("").contains("audio upload failed"));
    let episode = summary.episode.expect("episode");
    assert!(!episode.uploaded);
    assert_eq!(h.ledger.latest_episodes(5).expect("episodes").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pruning_keeps_aggregate_counts() {
    let h = harness_with(
        FakeArchive::with_items(3),
        FakeNotebook::new().reject_source("item-0"),
        MemoryUploader::new(),
        SyncOptions {
            retain_item_outcomes: false,
            ..options()
        },
    );

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert!(h.ledger.item_outcomes(summary.run_id).expect("outcomes").is_empty());
    let run = h.ledger.get_run(summary.run_id).expect("get").expect("run");
    assert_eq!(run.counts.ingested, 2);
    assert_eq!(run.counts.failed, 1);
}

// ---------------------------------------------------------------------------
// 4. Concurrency and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn status_fetches_respect_concurrency_limit() {
    let mut opts = options();
    opts.source_poll.concurrency = 3;
    let h = harness_with(
        FakeArchive::with_items(12),
        FakeNotebook::new().with_latency(Duration::from_millis(500)),
        MemoryUploader::new(),
        opts,
    );

    h.orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(h.notebook.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_leaves_run_running_until_failed() {
    let notebook = FakeNotebook::new().default_source_script(vec![Step::pending()]);
    let h = harness(FakeArchive::with_items(2), notebook);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        trigger.cancel();
    });

    let err = h.orchestrator.run_weekly_sync(&cancel).await.unwrap_err();
    let run_id = match err {
        SyncError::Cancelled { run_id } => run_id,
        other => panic!("expected Cancelled, got {other}"),
    };
    let running = h.ledger.running_run().expect("running").expect("left running");
    assert_eq!(running.id, run_id);

    let err = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning { .. }));

    h.ledger.fail_run(run_id, "operator reset").expect("fail");
    assert!(h.ledger.running_run().expect("running").is_none());
}

#[tokio::test(start_paused = true)]
async fn archive_outage_fails_the_run() {
    let h = harness(FakeArchive::with_items(2).failing("readeck down"), FakeNotebook::new());

    let summary = h
        .orchestrator
        .run_weekly_sync(&CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.as_deref().unwrap_or("").contains("readeck down"));
    assert!(h.notebook.calls().is_empty());
}
