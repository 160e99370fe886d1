use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use queuectl_core::{
    ConfigKey, EpochMs, Job, JobState, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};

use crate::error::StoreError;

/// How long sqlite itself waits on a held write lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Additional dispatch-level retries on top of the busy timeout. Exceeding
/// this indicates a stuck lock, not ordinary contention.
const DISPATCH_RETRY_BUDGET: u32 = 5;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Counts per state for status reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl StateSummary {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }
}

/// The single shared store. Every piece of authoritative state lives here;
/// its transactions are also the cross-process dispatch lock, so workers
/// need no coordination channel besides this file.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Opens (creating if needed) the store and installs the schema and
    /// default config. Safe to call from every process on every start.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL keeps status/list reads from blocking behind the dispatch lock.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        debug!(db = %db_path.display(), journal_mode = %mode, "opened job store");
        conn.execute_batch(include_str!("../migrations/0001_init.sql"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a fresh pending job. `max_retries` is captured from config
    /// at this moment; later config changes do not touch existing jobs.
    pub fn create_job(&self, id: &str, command: &str, now: EpochMs) -> Result<Job> {
        let max_retries = self.config_u32(ConfigKey::MaxRetries, DEFAULT_MAX_RETRIES)?;
        let conn = self.conn.lock().unwrap();
        let res = conn.execute(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, run_at, enqueued_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4)",
            params![id, command, max_retries, now],
        );
        match res {
            Ok(_) => Ok(Job {
                id: id.to_string(),
                command: command.to_string(),
                state: JobState::Pending,
                attempts: 0,
                max_retries,
                run_at: now,
                enqueued_at: now,
                updated_at: now,
                last_error: None,
                exit_code: None,
            }),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::DuplicateId(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// The dispatch primitive: atomically claims the oldest eligible
    /// pending job and flips it to `processing`.
    ///
    /// The select-and-update runs inside an IMMEDIATE transaction, which
    /// reserves the write lock up front; concurrent workers serialize on
    /// it, so a job can only ever be handed to one caller. Busy errors are
    /// retried here with a short pause before they surface.
    pub fn fetch_job_atomically(&self, now: EpochMs) -> Result<Option<Job>> {
        for attempt in 0..DISPATCH_RETRY_BUDGET {
            let claimed = {
                let conn = self.conn.lock().unwrap();
                Self::try_claim(&conn, now)
            };
            match claimed {
                Err(StoreError::Sqlite(e)) if is_busy(&e) => {
                    debug!(attempt, "dispatch transaction busy, retrying");
                    std::thread::sleep(Duration::from_millis(50 * (attempt as u64 + 1)));
                }
                other => return other,
            }
        }
        Err(StoreError::Contended {
            attempts: DISPATCH_RETRY_BUDGET,
        })
    }

    fn try_claim(conn: &Connection, now: EpochMs) -> Result<Option<Job>> {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let job = tx
            .query_row(
                "SELECT id, command, state, attempts, max_retries, run_at, enqueued_at,
                        updated_at, last_error, exit_code
                 FROM jobs
                 WHERE state = 'pending' AND run_at <= ?1
                 ORDER BY run_at ASC, enqueued_at ASC, id ASC
                 LIMIT 1",
                params![now],
                row_to_job,
            )
            .optional()?;

        match job {
            Some(mut job) => {
                tx.execute(
                    "UPDATE jobs SET state = 'processing', updated_at = ?1 WHERE id = ?2",
                    params![now, job.id],
                )?;
                tx.commit()?;
                job.state = JobState::Processing;
                job.updated_at = now;
                Ok(Some(job))
            }
            None => {
                tx.commit()?;
                Ok(None)
            }
        }
    }

    /// Settles a processing job as succeeded.
    pub fn mark_completed(&self, id: &str, exit_code: i32, now: EpochMs) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET state = 'completed', exit_code = ?1, last_error = NULL, updated_at = ?2
             WHERE id = ?3 AND state = 'processing'",
            params![exit_code, now, id],
        )?;
        require_transition(changed, id, JobState::Processing)
    }

    /// Puts a failed processing job back into the pending queue with its
    /// new attempt count and backoff deadline.
    pub fn schedule_retry(
        &self,
        id: &str,
        attempts: u32,
        run_at: EpochMs,
        last_error: Option<&str>,
        exit_code: i32,
        now: EpochMs,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET state = 'pending', attempts = ?1, run_at = ?2,
                             last_error = ?3, exit_code = ?4, updated_at = ?5
             WHERE id = ?6 AND state = 'processing'",
            params![attempts, run_at, last_error, exit_code, now, id],
        )?;
        require_transition(changed, id, JobState::Processing)
    }

    /// Moves a processing job to the DLQ. State and the final attempt
    /// count land in one statement so a crash cannot separate them.
    pub fn mark_dead(
        &self,
        id: &str,
        attempts: u32,
        last_error: Option<&str>,
        exit_code: i32,
        now: EpochMs,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET state = 'dead', attempts = ?1, last_error = ?2,
                             exit_code = ?3, updated_at = ?4
             WHERE id = ?5 AND state = 'processing'",
            params![attempts, last_error, exit_code, now, id],
        )?;
        require_transition(changed, id, JobState::Processing)
    }

    /// Returns a dead job to the pending queue with a fresh retry budget.
    pub fn dlq_requeue(&self, id: &str, now: EpochMs) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, run_at = ?1,
                             last_error = NULL, exit_code = NULL, updated_at = ?1
             WHERE id = ?2 AND state = 'dead'",
            params![now, id],
        )?;
        require_transition(changed, id, JobState::Dead)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                "SELECT id, command, state, attempts, max_retries, run_at, enqueued_at,
                        updated_at, last_error, exit_code
                 FROM jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, command, state, attempts, max_retries, run_at, enqueued_at,
                    updated_at, last_error, exit_code
             FROM jobs WHERE state = ?1 ORDER BY enqueued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![state.as_str()], row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Every job, grouped by lifecycle stage.
    pub fn list_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for state in JobState::ALL {
            jobs.extend(self.list_by_state(state)?);
        }
        Ok(jobs)
    }

    pub fn summary(&self) -> Result<StateSummary> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut summary = StateSummary::default();
        for row in rows {
            let (state, count) = row?;
            match JobState::parse(&state) {
                Some(JobState::Pending) => summary.pending = count as u64,
                Some(JobState::Processing) => summary.processing = count as u64,
                Some(JobState::Completed) => summary.completed = count as u64,
                Some(JobState::Dead) => summary.dead = count as u64,
                None => {}
            }
        }
        Ok(summary)
    }

    pub fn config_get(&self, key: ConfigKey) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Validated upsert; unknown keys and malformed values never reach
    /// the table.
    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = ConfigKey::parse(key)?;
        key.validate_value(value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    /// Config read for workers: the stored value, falling back to the
    /// default if the row is somehow missing or unparseable.
    pub fn config_u32(&self, key: ConfigKey, default: u32) -> Result<u32> {
        Ok(self
            .config_get(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default))
    }

    pub fn backoff_base(&self) -> Result<u32> {
        self.config_u32(ConfigKey::BackoffBase, DEFAULT_BACKOFF_BASE)
    }
}

fn require_transition(changed: usize, id: &str, expected: JobState) -> Result<()> {
    if changed == 0 {
        return Err(StoreError::NotInState {
            id: id.to_string(),
            expected,
        });
    }
    Ok(())
}

fn row_to_job(r: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let state: String = r.get(2)?;
    Ok(Job {
        id: r.get(0)?,
        command: r.get(1)?,
        state: JobState::parse(&state).unwrap_or(JobState::Pending),
        attempts: r.get::<_, i64>(3)? as u32,
        max_retries: r.get::<_, i64>(4)? as u32,
        run_at: r.get(5)?,
        enqueued_at: r.get(6)?,
        updated_at: r.get(7)?,
        last_error: r.get(8)?,
        exit_code: r.get(9)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}
