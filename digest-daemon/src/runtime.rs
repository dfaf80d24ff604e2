use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;

use digest_core::paths::{digest_root, logs_dir, socket_path};
use digest_core::{config, LogFormat, Settings};
use digest_sync::{RunSummary, WeeklySyncOrchestrator};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};

const ROTATION_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LIST_LIMIT: usize = 10;

/// State every daemon task reads.
struct Shared {
    home: PathBuf,
    orchestrator: WeeklySyncOrchestrator,
    schedule: Option<String>,
    /// Cancelled by `stop` or ctrl-c; also cancels the run in flight.
    shutdown: CancellationToken,
    /// Held for the duration of a run started by this process.
    run_slot: Mutex<()>,
    started_at: DateTime<Utc>,
}

/// A configured daemon, not yet serving.
pub struct Daemon {
    home: PathBuf,
    orchestrator: WeeklySyncOrchestrator,
    schedule: Option<String>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(home: impl Into<PathBuf>, orchestrator: WeeklySyncOrchestrator) -> Self {
        Self {
            home: home.into(),
            orchestrator,
            schedule: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Trigger a weekly sync on this 6-field cron expression (seconds first).
    pub fn with_schedule(mut self, cron: impl Into<String>) -> Self {
        self.schedule = Some(cron.into());
        self
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until `stop`, ctrl-c or a task failure, then wait for the run
    /// in flight (if any) to observe cancellation.
    pub async fn serve(self) -> Result<(), DaemonError> {
        ensure_runtime_dirs(&self.home)?;
        match self.orchestrator.sweep_stale_runs() {
            Ok(failed) if !failed.is_empty() => {
                tracing::warn!(count = failed.len(), "stale runs failed at startup")
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "stale run sweep failed at startup"),
        }

        let shared = Arc::new(Shared {
            home: self.home,
            orchestrator: self.orchestrator,
            schedule: self.schedule,
            shutdown: self.shutdown,
            run_slot: Mutex::new(()),
            started_at: Utc::now(),
        });

        let mut scheduler = match shared.schedule.clone() {
            Some(cron) => Some(start_scheduler(shared.clone(), &cron).await?),
            None => None,
        };

        let socket_handle = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let result = socket_server_task(shared.clone()).await;
                shared.shutdown.cancel();
                result
            })
        };

        let rotation_handle = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let result = log_rotation_task(shared.home.clone(), shared.shutdown.clone()).await;
                shared.shutdown.cancel();
                result
            })
        };

        let signal_handle = {
            let shutdown = shared.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => Ok(()),
                    signal = tokio::signal::ctrl_c() => match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            shutdown.cancel();
                            Ok(())
                        }
                        Err(err) => {
                            shutdown.cancel();
                            Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}")))
                        }
                    },
                }
            })
        };

        let (socket_result, rotation_result, signal_result) =
            tokio::join!(socket_handle, rotation_handle, signal_handle);

        if let Some(scheduler) = scheduler.as_mut() {
            if let Err(err) = scheduler.shutdown().await {
                tracing::warn!(error = %err, "scheduler shutdown failed");
            }
        }
        // Wait for an in-flight run to return its cancellation.
        let _slot = shared.run_slot.lock().await;
        tracing::info!("daemon stopped");

        handle_join("socket_server", socket_result)?;
        handle_join("log_rotation", rotation_result)?;
        handle_join("signal_handler", signal_result)?;
        Ok(())
    }
}

/// Load settings, install tracing and block the current thread on the
/// daemon until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let mut settings = config::load_at(home)?;
    settings.apply_env()?;
    init_tracing(settings.log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), settings))
}

/// Run the daemon with production adapters built from `settings`.
pub async fn run(home: PathBuf, settings: Settings) -> Result<(), DaemonError> {
    let orchestrator = WeeklySyncOrchestrator::from_settings(&settings, &home)?;
    Daemon::new(home, orchestrator)
        .with_schedule(settings.schedule.cron.clone())
        .serve()
        .await
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Console => builder.try_init(),
    };
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn trigger_run(shared: &Shared) -> Result<RunSummary, DaemonError> {
    let Ok(_slot) = shared.run_slot.try_lock() else {
        return Err(DaemonError::Busy);
    };
    if shared.shutdown.is_cancelled() {
        return Err(DaemonError::Protocol("daemon is shutting down".to_string()));
    }
    Ok(shared.orchestrator.run_weekly_sync(&shared.shutdown).await?)
}

async fn start_scheduler(shared: Arc<Shared>, cron: &str) -> Result<JobScheduler, DaemonError> {
    let scheduler = JobScheduler::new().await.map_err(schedule_err)?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let shared = shared.clone();
        Box::pin(async move {
            tracing::info!("scheduled weekly sync triggered");
            match trigger_run(&shared).await {
                Ok(summary) => tracing::info!(
                    run_id = %summary.run_id,
                    status = %summary.status,
                    "scheduled weekly sync finished"
                ),
                Err(err) => tracing::error!(error = %err, "scheduled weekly sync failed"),
            }
        })
    })
    .map_err(schedule_err)?;
    scheduler.add(job).await.map_err(schedule_err)?;
    scheduler.start().await.map_err(schedule_err)?;
    tracing::info!(cron, "weekly trigger scheduled");
    Ok(scheduler)
}

fn schedule_err(err: JobSchedulerError) -> DaemonError {
    DaemonError::Schedule(err.to_string())
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(shared: Arc<Shared>) -> Result<(), DaemonError> {
    let socket = socket_path(&shared.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, shared).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, shared: Arc<Shared>) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                let response = DaemonResponse::error(format!("invalid request JSON: {err}"));
                write_response(&mut writer, &response).await?;
                continue;
            }
        };
        let response = dispatch(&shared, &request).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }
    Ok(())
}

async fn dispatch(shared: &Shared, request: &DaemonRequest) -> DaemonResponse {
    let limit = request.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let result = match request.cmd.as_str() {
        "status" => status_payload(shared),
        "run" => match trigger_run(shared).await {
            Ok(summary) => to_json(summary),
            Err(err) => Err(err),
        },
        "history" => shared
            .orchestrator
            .run_history(limit)
            .map_err(DaemonError::from)
            .and_then(to_json),
        "episodes" => shared
            .orchestrator
            .latest_episodes(limit)
            .map_err(DaemonError::from)
            .and_then(to_json),
        "stop" => {
            tracing::info!("stop requested over control socket");
            shared.shutdown.cancel();
            Ok(json!({ "stopping": true }))
        }
        other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    };
    match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

fn status_payload(shared: &Shared) -> Result<Value, DaemonError> {
    let ledger = shared.orchestrator.ledger();
    let active_run = ledger.running_run()?;
    let last_run = ledger.run_history(1)?.into_iter().next();
    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": shared.started_at,
        "schedule": shared.schedule,
        "run_in_progress": shared.run_slot.try_lock().is_err(),
        "active_run": active_run,
        "last_run": last_run,
        "socket": socket_path(&shared.home).display().to_string(),
    }))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, DaemonError> {
    Ok(serde_json::to_value(value)?)
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }
    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "daemon socket already in use: {}",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "removing stale daemon socket before bind");
    match fs::remove_file(socket) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(io_err(socket, err)),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(home: PathBuf, shutdown: CancellationToken) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // rotate_logs logs its own failures
                tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&home))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [digest_root(home), logs_dir(home)] {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use digest_core::Ledger;
    use digest_remote::fake::{FakeArchive, FakeNotebook};
    use digest_sync::SyncOptions;
    use tempfile::TempDir;

    use super::*;

    fn shared(home: &Path, schedule: Option<&str>) -> Shared {
        let orchestrator = WeeklySyncOrchestrator::new(
            Arc::new(Ledger::open_in_memory().expect("ledger")),
            Arc::new(FakeArchive::with_items(1)),
            Arc::new(FakeNotebook::new()),
            SyncOptions::default(),
        );
        Shared {
            home: home.to_path_buf(),
            orchestrator,
            schedule: schedule.map(str::to_string),
            shutdown: CancellationToken::new(),
            run_slot: Mutex::new(()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn status_reports_idle_daemon() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path(), Some("0 0 23 * * Sun"));

        let payload = status_payload(&shared).expect("status");

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["schedule"], json!("0 0 23 * * Sun"));
        assert_eq!(payload["run_in_progress"], json!(false));
        assert!(payload["active_run"].is_null());
        assert!(payload["last_run"].is_null());
    }

    #[tokio::test]
    async fn run_request_is_refused_while_slot_is_held() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path(), None);
        let _held = shared.run_slot.lock().await;

        let response = dispatch(&shared, &DaemonRequest::new("run")).await;

        assert!(!response.ok);
        assert!(response.error.unwrap_or_default().contains("already running"));
        assert!(shared.orchestrator.run_history(5).expect("history").is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_response() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path(), None);

        let response = dispatch(&shared, &DaemonRequest::new("reindex")).await;

        assert_eq!(
            response.error.as_deref(),
            Some("daemon protocol error: unknown command 'reindex'")
        );
    }

    #[tokio::test]
    async fn stop_cancels_shutdown_token() {
        let home = TempDir::new().expect("home");
        let shared = shared(home.path(), None);

        let response = dispatch(&shared, &DaemonRequest::new("stop")).await;

        assert!(response.ok);
        assert!(shared.shutdown.is_cancelled());
        let refused = trigger_run(&shared).await.unwrap_err();
        assert!(refused.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let home = TempDir::new().expect("home");
        let shared = Arc::new(shared(home.path(), None));

        let Err(err) = start_scheduler(shared, "every sunday").await else {
            panic!("expected start_scheduler to fail");
        };

        assert!(matches!(err, DaemonError::Schedule(_)));
    }
}
