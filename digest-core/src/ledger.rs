//! SQLite ledger of batch runs, per-item outcomes, generation jobs and
//! episodes.
//!
//! # Tables
//!
//! ```text
//! batch_runs        one row per weekly cycle; at most one row has
//!                   status = 'running' (partial unique index)
//! item_outcomes     upsert target keyed by (run_id, source_ref)
//! generation_jobs   upsert target keyed by (run_id, kind)
//! episodes          produced audio artifacts, unique by artifact_ref
//! ```
//!
//! Every public method is one transaction. Mutations of a run are guarded
//! by `status = 'running'` inside that transaction, so a terminal run can
//! never be reopened or edited, whatever the interleaving of callers.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::error::{ledger_io_err, LedgerError};
use crate::types::{
    BatchRun, Episode, GenerationJob, GenerationKind, GenerationState, ItemOutcome, ItemState,
    JobId, OutcomeCounts, RunId, RunStage, RunStatus, SourceItem, SourceRef,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batch_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    item_count INTEGER NOT NULL DEFAULT 0,
    batch_ref TEXT,
    error TEXT,
    updated_at TEXT NOT NULL,
    ingested_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    timed_out_count INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS batch_runs_single_running
    ON batch_runs(status) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS item_outcomes (
    run_id INTEGER NOT NULL REFERENCES batch_runs(id),
    source_ref TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    remote_job_id TEXT,
    detail TEXT,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (run_id, source_ref)
);

CREATE TABLE IF NOT EXISTS generation_jobs (
    run_id INTEGER NOT NULL REFERENCES batch_runs(id),
    kind TEXT NOT NULL,
    job_id TEXT NOT NULL,
    state TEXT NOT NULL,
    result_ref TEXT,
    poll_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (run_id, kind)
);

CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_run_id INTEGER NOT NULL REFERENCES batch_runs(id),
    artifact_ref TEXT NOT NULL UNIQUE,
    name TEXT,
    created_at TEXT NOT NULL,
    uploaded INTEGER NOT NULL DEFAULT 0,
    public_url TEXT
);
";

const RUN_COLUMNS: &str = "id, started_at, completed_at, status, stage, item_count, batch_ref, \
     error, updated_at, ingested_count, failed_count, timed_out_count";

const EPISODE_COLUMNS: &str =
    "id, batch_run_id, artifact_ref, name, created_at, uploaded, public_url";

/// Persistent record of batch runs. Cheap to share behind an `Arc`.
pub struct Ledger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("path", &self.path).finish()
    }
}

impl Ledger {
    /// Open (creating if needed) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ledger_io_err(dir, e))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory ledger (tests and dry runs).
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, LedgerError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Open a new `running` run.
    ///
    /// Fails with [`LedgerError::AlreadyRunning`] while another run holds the
    /// running slot; in that case nothing is written.
    pub fn begin_run(&self, item_count: u32) -> Result<BatchRun, LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(run_id) = running_id(&tx)? {
            return Err(LedgerError::AlreadyRunning { run_id });
        }

        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO batch_runs (started_at, status, stage, item_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?1)",
            params![now, RunStatus::Running, RunStage::Fetching, item_count],
        );
        if let Err(err) = inserted {
            // Lost a race against another process between the check and insert.
            if is_constraint_violation(&err) {
                if let Some(run_id) = running_id(&tx)? {
                    return Err(LedgerError::AlreadyRunning { run_id });
                }
            }
            return Err(err.into());
        }

        let run_id = RunId(tx.last_insert_rowid());
        let run = load_run(&tx, run_id)?;
        tx.commit()?;
        tracing::debug!(run_id = %run_id, item_count, "batch run opened");
        Ok(run)
    }

    pub fn set_item_count(&self, run_id: RunId, item_count: u32) -> Result<(), LedgerError> {
        self.mutate_running(run_id, |tx, now| {
            tx.execute(
                "UPDATE batch_runs SET item_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![item_count, now, run_id],
            )?;
            Ok(())
        })
    }

    /// Record a stage transition; doubles as a progress heartbeat.
    pub fn record_stage(&self, run_id: RunId, stage: RunStage) -> Result<(), LedgerError> {
        self.mutate_running(run_id, |tx, now| {
            tx.execute(
                "UPDATE batch_runs SET stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![stage, now, run_id],
            )?;
            Ok(())
        })
    }

    pub fn set_batch_ref(&self, run_id: RunId, batch_ref: &str) -> Result<(), LedgerError> {
        self.mutate_running(run_id, |tx, now| {
            tx.execute(
                "UPDATE batch_runs SET batch_ref = ?1, updated_at = ?2 WHERE id = ?3",
                params![batch_ref, now, run_id],
            )?;
            Ok(())
        })
    }

    /// Upsert the outcome of one item, keyed by `(run_id, source_ref)`.
    ///
    /// Calling this twice with the same arguments leaves exactly one row.
    pub fn record_item_outcome(
        &self,
        run_id: RunId,
        item: &SourceItem,
        detail: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.mutate_running(run_id, |tx, now| {
            tx.execute(
                "INSERT INTO item_outcomes
                    (run_id, source_ref, state, attempts, remote_job_id, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, source_ref) DO UPDATE SET
                    state = excluded.state,
                    attempts = excluded.attempts,
                    remote_job_id = excluded.remote_job_id,
                    detail = excluded.detail,
                    recorded_at = excluded.recorded_at",
                params![
                    run_id,
                    item.source_ref,
                    item.state,
                    item.attempts,
                    item.remote_job_id,
                    detail,
                    now
                ],
            )?;
            refresh_counts(tx, run_id, now)
        })
    }

    /// Upsert a generation job, keyed by `(run_id, kind)`.
    pub fn record_generation_job(
        &self,
        run_id: RunId,
        job: &GenerationJob,
    ) -> Result<(), LedgerError> {
        self.mutate_running(run_id, |tx, now| {
            tx.execute(
                "INSERT INTO generation_jobs (run_id, kind, job_id, state, result_ref, poll_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id, kind) DO UPDATE SET
                    job_id = excluded.job_id,
                    state = excluded.state,
                    result_ref = excluded.result_ref,
                    poll_count = excluded.poll_count",
                params![
                    run_id,
                    job.kind,
                    job.job_id,
                    job.state,
                    job.result_ref,
                    job.poll_count
                ],
            )?;
            tx.execute(
                "UPDATE batch_runs SET updated_at = ?1 WHERE id = ?2",
                params![now, run_id],
            )?;
            Ok(())
        })
    }

    /// Move a run to a terminal status. Terminal runs reject every further
    /// mutation, including a second `complete_run`.
    pub fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<BatchRun, LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NonTerminalStatus { run_id, status });
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run = finish_run(&tx, run_id, status, error, Utc::now())?;
        tx.commit()?;
        tracing::debug!(run_id = %run_id, status = %status, "batch run completed");
        Ok(run)
    }

    /// Operator escape hatch: mark a (stale) running run as failed.
    pub fn fail_run(&self, run_id: RunId, reason: &str) -> Result<BatchRun, LedgerError> {
        self.complete_run(run_id, RunStatus::Failed, Some(reason))
    }

    /// Fail every `running` run whose last progress is older than
    /// `stale_after` relative to `now`. Returns the runs that were failed.
    pub fn fail_stale_runs(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchRun>, LedgerError> {
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(running) = running_id(&tx)? else {
            return Ok(Vec::new());
        };
        let run = load_run(&tx, running)?;
        let mut failed = Vec::new();
        if cutoff.is_some_and(|cutoff| run.updated_at < cutoff) {
            let reason = format!(
                "stale run: no progress since {} (stage {})",
                run.updated_at.to_rfc3339(),
                run.stage
            );
            failed.push(finish_run(&tx, running, RunStatus::Failed, Some(&reason), now)?);
        }
        tx.commit()?;
        Ok(failed)
    }

    // -----------------------------------------------------------------------
    // Run queries
    // -----------------------------------------------------------------------

    pub fn get_run(&self, run_id: RunId) -> Result<Option<BatchRun>, LedgerError> {
        let conn = self.conn();
        let sql = format!("SELECT {RUN_COLUMNS} FROM batch_runs WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![run_id], run_from_row)
            .optional()?)
    }

    pub fn running_run(&self) -> Result<Option<BatchRun>, LedgerError> {
        let conn = self.conn();
        let sql = format!("SELECT {RUN_COLUMNS} FROM batch_runs WHERE status = 'running'");
        Ok(conn.query_row(&sql, [], run_from_row).optional()?)
    }

    /// Most recent runs first.
    pub fn run_history(&self, limit: usize) -> Result<Vec<BatchRun>, LedgerError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM batch_runs ORDER BY started_at DESC, id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![clamp_limit(limit)], run_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn item_outcomes(&self, run_id: RunId) -> Result<Vec<ItemOutcome>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, source_ref, state, attempts, remote_job_id, detail, recorded_at
             FROM item_outcomes WHERE run_id = ?1 ORDER BY source_ref",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(ItemOutcome {
                run_id: row.get(0)?,
                source_ref: row.get(1)?,
                state: row.get(2)?,
                attempts: row.get(3)?,
                remote_job_id: row.get(4)?,
                detail: row.get(5)?,
                recorded_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn generation_jobs(&self, run_id: RunId) -> Result<Vec<GenerationJob>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT job_id, kind, state, result_ref, poll_count
             FROM generation_jobs WHERE run_id = ?1 ORDER BY kind DESC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(GenerationJob {
                job_id: row.get(0)?,
                kind: row.get(1)?,
                state: row.get(2)?,
                result_ref: row.get(3)?,
                poll_count: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop per-item rows of a terminal run. Aggregate counts stay on the
    /// run row.
    pub fn prune_item_outcomes(&self, run_id: RunId) -> Result<usize, LedgerError> {
        let conn = self.conn();
        let status: Option<RunStatus> = conn
            .query_row(
                "SELECT status FROM batch_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Err(LedgerError::RunNotFound { run_id }),
            Some(RunStatus::Running) => Err(LedgerError::AlreadyRunning { run_id }),
            Some(_) => Ok(conn.execute(
                "DELETE FROM item_outcomes WHERE run_id = ?1",
                params![run_id],
            )?),
        }
    }

    // -----------------------------------------------------------------------
    // Episodes
    // -----------------------------------------------------------------------

    /// Record a produced artifact. Recording the same `artifact_ref` again
    /// returns the existing row unchanged.
    pub fn add_episode(
        &self,
        run_id: RunId,
        artifact_ref: &str,
        name: Option<&str>,
    ) -> Result<Episode, LedgerError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO episodes (batch_run_id, artifact_ref, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(artifact_ref) DO NOTHING",
            params![run_id, artifact_ref, name, Utc::now()],
        )?;
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE artifact_ref = ?1");
        Ok(conn.query_row(&sql, params![artifact_ref], episode_from_row)?)
    }

    pub fn mark_episode_uploaded(
        &self,
        episode_id: i64,
        public_url: &str,
    ) -> Result<Option<Episode>, LedgerError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE episodes SET uploaded = 1, public_url = ?1 WHERE id = ?2",
            params![public_url, episode_id],
        )?;
        let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![episode_id], episode_from_row)
            .optional()?)
    }

    /// Most recent episodes first.
    pub fn latest_episodes(&self, limit: usize) -> Result<Vec<Episode>, LedgerError> {
        self.query_episodes("", limit)
    }

    /// Most recent uploaded episodes first.
    pub fn uploaded_episodes(&self, limit: usize) -> Result<Vec<Episode>, LedgerError> {
        self.query_episodes("WHERE uploaded = 1", limit)
    }

    fn query_episodes(&self, filter: &str, limit: usize) -> Result<Vec<Episode>, LedgerError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {EPISODE_COLUMNS} FROM episodes {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![clamp_limit(limit)], episode_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Run `f` inside an immediate transaction after checking that `run_id`
    /// exists and is still `running`.
    fn mutate_running<F>(&self, run_id: RunId, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&Transaction<'_>, DateTime<Utc>) -> Result<(), LedgerError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_running(&tx, run_id)?;
        f(&tx, Utc::now())?;
        tx.commit()?;
        Ok(())
    }
}

fn running_id(tx: &Transaction<'_>) -> Result<Option<RunId>, LedgerError> {
    Ok(tx
        .query_row(
            "SELECT id FROM batch_runs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn ensure_running(tx: &Transaction<'_>, run_id: RunId) -> Result<(), LedgerError> {
    let status: Option<RunStatus> = tx
        .query_row(
            "SELECT status FROM batch_runs WHERE id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Err(LedgerError::RunNotFound { run_id }),
        Some(RunStatus::Running) => Ok(()),
        Some(status) => Err(LedgerError::RunFinalized { run_id, status }),
    }
}

fn load_run(tx: &Transaction<'_>, run_id: RunId) -> Result<BatchRun, LedgerError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM batch_runs WHERE id = ?1");
    tx.query_row(&sql, params![run_id], run_from_row)
        .optional()?
        .ok_or(LedgerError::RunNotFound { run_id })
}

fn finish_run(
    tx: &Transaction<'_>,
    run_id: RunId,
    status: RunStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<BatchRun, LedgerError> {
    ensure_running(tx, run_id)?;
    refresh_counts(tx, run_id, now)?;
    tx.execute(
        "UPDATE batch_runs
         SET status = ?1, error = ?2, completed_at = ?3, updated_at = ?3, stage = ?4
         WHERE id = ?5 AND status = 'running'",
        params![status, error, now, RunStage::Finished, run_id],
    )?;
    load_run(tx, run_id)
}

fn refresh_counts(
    tx: &Transaction<'_>,
    run_id: RunId,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    tx.execute(
        "UPDATE batch_runs SET
            ingested_count = (SELECT COUNT(*) FROM item_outcomes
                              WHERE run_id = ?1 AND state = 'ingested'),
            failed_count = (SELECT COUNT(*) FROM item_outcomes
                            WHERE run_id = ?1 AND state = 'failed'),
            timed_out_count = (SELECT COUNT(*) FROM item_outcomes
                               WHERE run_id = ?1 AND state = 'timed_out'),
            updated_at = ?2
         WHERE id = ?1",
        params![run_id, now],
    )?;
    Ok(())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<BatchRun> {
    Ok(BatchRun {
        id: row.get(0)?,
        started_at: row.get(1)?,
        completed_at: row.get(2)?,
        status: row.get(3)?,
        stage: row.get(4)?,
        item_count: row.get(5)?,
        batch_ref: row.get(6)?,
        error: row.get(7)?,
        updated_at: row.get(8)?,
        counts: OutcomeCounts {
            ingested: row.get(9)?,
            failed: row.get(10)?,
            timed_out: row.get(11)?,
        },
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        batch_run_id: row.get(1)?,
        artifact_ref: row.get(2)?,
        name: row.get(3)?,
        created_at: row.get(4)?,
        uploaded: row.get(5)?,
        public_url: row.get(6)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// SQL conversions
// ---------------------------------------------------------------------------

/// Store string enums by their `as_str` form and parse them back on read.
macro_rules! sql_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e| FromSqlError::Other(Box::new(e)))
                }
            }
        )+
    };
}

sql_text_enum!(RunStatus, RunStage, ItemState, GenerationKind, GenerationState);

impl ToSql for RunId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for RunId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(RunId)
    }
}

impl ToSql for SourceRef {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for SourceRef {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(SourceRef)
    }
}

impl ToSql for JobId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for JobId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(JobId)
    }
}
