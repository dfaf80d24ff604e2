//! Drives a served daemon over its Unix socket with in-memory boundaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use digest_core::paths::socket_path;
use digest_core::{Ledger, RunStatus};
use digest_daemon::{request_episodes, request_history, request_run, request_status, Daemon};
use digest_remote::fake::{FakeArchive, FakeNotebook, MemoryUploader};
use digest_sync::{SyncOptions, WeeklySyncOrchestrator};

fn orchestrator(ledger: Arc<Ledger>) -> WeeklySyncOrchestrator {
    WeeklySyncOrchestrator::new(
        ledger,
        Arc::new(FakeArchive::with_items(2)),
        Arc::new(FakeNotebook::new()),
        SyncOptions {
            stale_after: None,
            ..SyncOptions::default()
        },
    )
    .with_uploader(Arc::new(MemoryUploader::new()))
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..250 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daemon socket never appeared at {}", path.display());
}

async fn raw_request(socket: &Path, line: &str) -> Value {
    let stream = UnixStream::connect(socket).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("write request");
    let reply = BufReader::new(reader)
        .lines()
        .next_line()
        .await
        .expect("read reply")
        .expect("reply line");
    serde_json::from_str(&reply).expect("reply json")
}

async fn blocking<T, F>(home: &Path, call: F) -> T
where
    T: Send + 'static,
    F: FnOnce(PathBuf) -> T + Send + 'static,
{
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || call(home))
        .await
        .expect("client thread")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_history_episodes_and_stop() {
    let home = TempDir::new().expect("home");
    let ledger = Arc::new(Ledger::open_in_memory().expect("ledger"));
    let daemon = Daemon::new(home.path(), orchestrator(ledger.clone()));
    let server = tokio::spawn(daemon.serve());
    let socket = socket_path(home.path());
    wait_for_socket(&socket).await;

    let status = blocking(home.path(), |home| request_status(&home))
        .await
        .expect("status");
    assert_eq!(status["running"], Value::Bool(true));
    assert!(status["last_run"].is_null());

    let summary = blocking(home.path(), |home| request_run(&home))
        .await
        .expect("run");
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.item_count, 2);
    assert!(summary.episode.as_ref().is_some_and(|e| e.uploaded));

    let history = blocking(home.path(), |home| request_history(&home, 5))
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, summary.run_id);

    let episodes = blocking(home.path(), |home| request_episodes(&home, 5))
        .await
        .expect("episodes");
    assert_eq!(episodes.len(), 1);

    let stop = raw_request(&socket, r#"{"cmd":"stop"}"#).await;
    assert_eq!(stop["ok"], Value::Bool(true));

    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("daemon exits after stop")
        .expect("join")
        .expect("serve");
    assert!(!socket.exists(), "socket removed on shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_is_refused_while_ledger_holds_a_running_row() {
    let home = TempDir::new().expect("home");
    let ledger = Arc::new(Ledger::open_in_memory().expect("ledger"));
    let active = ledger.begin_run(0).expect("begin");
    let daemon = Daemon::new(home.path(), orchestrator(ledger.clone()));
    let shutdown = daemon.shutdown_token();
    let server = tokio::spawn(daemon.serve());
    let socket = socket_path(home.path());
    wait_for_socket(&socket).await;

    let reply = raw_request(&socket, r#"{"cmd":"run"}"#).await;
    assert_eq!(reply["ok"], Value::Bool(false));
    let error = reply["error"].as_str().unwrap_or_default();
    assert!(error.contains("already running"), "error: {error}");

    let status = raw_request(&socket, r#"{"cmd":"status"}"#).await;
    assert_eq!(status["data"]["active_run"]["id"], Value::from(active.id.0));
    assert_eq!(ledger.run_history(10).expect("history").len(), 1);

    shutdown.cancel();
    server.await.expect("join").expect("serve");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_lines_get_error_replies() {
    let home = TempDir::new().expect("home");
    let ledger = Arc::new(Ledger::open_in_memory().expect("ledger"));
    let daemon = Daemon::new(home.path(), orchestrator(ledger));
    let shutdown = daemon.shutdown_token();
    let server = tokio::spawn(daemon.serve());
    let socket = socket_path(home.path());
    wait_for_socket(&socket).await;

    let reply = raw_request(&socket, "not json").await;
    assert_eq!(reply["ok"], Value::Bool(false));
    assert!(reply["error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("invalid request JSON"));

    shutdown.cancel();
    server.await.expect("join").expect("serve");
}
