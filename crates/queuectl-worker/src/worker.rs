use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use queuectl_core::{decide_settlement, now_ms, Job, Settlement};
use queuectl_store::JobStore;

use crate::executor::run_shell;
use crate::registry::Registry;
use crate::shutdown;

/// Pause between dispatch misses so an empty queue does not busy-spin.
pub const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// The idle sleep is sliced so a shutdown signal cuts it short.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// The long-running worker entry point: registers this process, then
/// loops claim → execute → settle until a shutdown signal arrives. A
/// signal during execution lets the child finish and the outcome settle
/// before the loop exits.
pub fn run(db_path: &Path, registry: &Registry) -> Result<()> {
    shutdown::install()?;
    let store = JobStore::open(db_path)?;
    let pid = std::process::id();
    registry.register(pid)?;
    info!(pid, db = %db_path.display(), "worker started");

    while !shutdown::requested() {
        match step(&store) {
            Ok(true) => {}
            Ok(false) => idle_sleep(),
            Err(e) => {
                // Transient store trouble must not kill the worker.
                warn!(error = %e, "worker step failed");
                idle_sleep();
            }
        }
    }

    registry.deregister(pid);
    info!(pid, "worker shutting down");
    Ok(())
}

/// Claims and runs at most one job. Returns whether any work was done,
/// so the caller knows to keep draining or go idle. No store transaction
/// is held while the child process runs.
pub fn step(store: &JobStore) -> Result<bool> {
    let Some(job) = store.fetch_job_atomically(now_ms())? else {
        return Ok(false);
    };
    info!(id = %job.id, attempts = job.attempts, "processing job");
    execute_and_settle(store, &job)?;
    Ok(true)
}

fn execute_and_settle(store: &JobStore, job: &Job) -> Result<()> {
    let outcome = run_shell(&job.command);
    // backoff_base is read fresh at each failure; max_retries was
    // snapshotted onto the row at enqueue time.
    let backoff_base = store.backoff_base()?;
    let now = now_ms();
    match decide_settlement(job, &outcome, backoff_base, now) {
        Settlement::Completed { exit_code } => {
            store.mark_completed(&job.id, exit_code, now)?;
            info!(id = %job.id, "job completed");
        }
        Settlement::Retry {
            attempts,
            run_at,
            last_error,
            exit_code,
        } => {
            store.schedule_retry(&job.id, attempts, run_at, last_error.as_deref(), exit_code, now)?;
            info!(id = %job.id, attempts, delay_ms = run_at - now, "job failed, retry scheduled");
        }
        Settlement::Dead {
            attempts,
            last_error,
            exit_code,
        } => {
            store.mark_dead(&job.id, attempts, last_error.as_deref(), exit_code, now)?;
            warn!(id = %job.id, attempts, "job exhausted retries, moved to DLQ");
        }
    }
    Ok(())
}

fn idle_sleep() {
    let mut remaining = IDLE_SLEEP;
    while !shutdown::requested() && remaining > Duration::ZERO {
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::JobState;
    use std::time::Instant;
    use tempfile::tempdir;

    fn open_store() -> (JobStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = JobStore::open(&dir.path().join("queue.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn step_completes_a_successful_job() {
        let (store, _dir) = open_store();
        store.create_job("ok", "echo hi", now_ms()).unwrap();

        assert!(step(&store).unwrap());
        let job = store.get_job("ok").unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.last_error, None);

        // Nothing left to do.
        assert!(!step(&store).unwrap());
    }

    #[test]
    fn step_schedules_a_retry_with_backoff() {
        let (store, _dir) = open_store();
        store.config_set("max_retries", "2").unwrap();
        store.config_set("backoff_base", "2").unwrap();
        store.create_job("flaky", "false", now_ms()).unwrap();

        let before = now_ms();
        assert!(step(&store).unwrap());
        let job = store.get_job("flaky").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.exit_code, Some(1));
        // First retry waits 2^1 seconds.
        assert!(job.run_at >= before + 2_000);

        // Not eligible yet, so the next step is a miss.
        assert!(!step(&store).unwrap());
    }

    #[test]
    fn step_buries_a_job_with_no_budget() {
        let (store, _dir) = open_store();
        store.config_set("max_retries", "0").unwrap();
        store.create_job("doomed", "false", now_ms()).unwrap();

        assert!(step(&store).unwrap());
        let job = store.get_job("doomed").unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.exit_code, Some(1));
    }

    #[test]
    fn launch_failure_is_recorded_on_the_row() {
        let (store, _dir) = open_store();
        store.config_set("max_retries", "0").unwrap();
        store
            .create_job("invalid", "definitely-not-a-real-command-xyz", now_ms())
            .unwrap();

        assert!(step(&store).unwrap());
        let job = store.get_job("invalid").unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.exit_code, Some(127));
        assert!(job.last_error.is_some());
    }

    #[test]
    fn requeued_job_gets_a_fresh_budget_and_can_die_again() {
        let (store, _dir) = open_store();
        store.config_set("max_retries", "0").unwrap();
        store.create_job("stubborn", "false", now_ms()).unwrap();

        assert!(step(&store).unwrap());
        assert_eq!(
            store.get_job("stubborn").unwrap().unwrap().state,
            JobState::Dead
        );

        store.dlq_requeue("stubborn", now_ms()).unwrap();
        let job = store.get_job("stubborn").unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);

        assert!(step(&store).unwrap());
        let job = store.get_job("stubborn").unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn idle_sleep_is_cut_short_by_shutdown() {
        shutdown::reset();
        shutdown::request();
        let start = Instant::now();
        idle_sleep();
        assert!(start.elapsed() < IDLE_SLEEP);
        shutdown::reset();
    }
}
