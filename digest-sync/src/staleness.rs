//! Stale-run sweep: fail `running` rows that stopped making progress.
//!
//! A run cancelled by shutdown, or killed outright, keeps the single
//! running slot. The sweep releases it once the row's progress heartbeat
//! (`updated_at`) is older than `stale_after`.

use std::time::Duration;

use chrono::Utc;

use digest_core::{BatchRun, Ledger, LedgerError};

pub fn sweep_stale_runs(
    ledger: &Ledger,
    stale_after: Duration,
) -> Result<Vec<BatchRun>, LedgerError> {
    let failed = ledger.fail_stale_runs(stale_after, Utc::now())?;
    for run in &failed {
        tracing::warn!(
            run_id = %run.id,
            started_at = %run.started_at,
            stale_after_secs = stale_after.as_secs(),
            "stale batch run failed"
        );
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use digest_core::RunStatus;

    use super::*;

    #[test]
    fn fresh_running_run_is_left_alone() {
        let ledger = Ledger::open_in_memory().unwrap();
        let run = ledger.begin_run(0).unwrap();
        assert!(sweep_stale_runs(&ledger, Duration::from_secs(60)).unwrap().is_empty());
        assert_eq!(ledger.running_run().unwrap().unwrap().id, run.id);
    }

    #[test]
    fn zero_window_fails_running_run() {
        let ledger = Ledger::open_in_memory().unwrap();
        let run = ledger.begin_run(0).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let failed = sweep_stale_runs(&ledger, Duration::ZERO).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, run.id);
        assert_eq!(failed[0].status, RunStatus::Failed);
    }
}
