use crate::backoff::backoff_seconds;
use crate::model::Job;
use crate::time::EpochMs;

/// What one execution attempt produced. A command that could not be
/// launched at all is reported as exit 127 with a descriptive error, so
/// the settlement logic never has to distinguish the two cases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stderr_tail: Option<String>,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// How a finished attempt must be written back. This stays pure and
/// testable; the worker applies it to storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Completed {
        exit_code: i32,
    },
    Retry {
        attempts: u32,
        run_at: EpochMs,
        last_error: Option<String>,
        exit_code: i32,
    },
    Dead {
        attempts: u32,
        last_error: Option<String>,
        exit_code: i32,
    },
}

/// Retry budget rule: the failed attempt counts first, then the new count
/// is compared against the budget. `attempts+1 <= max_retries` retries
/// with `backoff_base ^ (attempts+1)` seconds of delay; anything beyond
/// goes to the DLQ. A job with `max_retries = 2` therefore executes at
/// most 3 times.
pub fn decide_settlement(
    job: &Job,
    outcome: &ExecOutcome,
    backoff_base: u32,
    now: EpochMs,
) -> Settlement {
    if outcome.succeeded() {
        return Settlement::Completed {
            exit_code: outcome.exit_code,
        };
    }

    let attempts = job.attempts + 1;
    if attempts <= job.max_retries {
        let delay_ms = backoff_seconds(backoff_base, attempts)
            .saturating_mul(1000)
            .min(i64::MAX as u64) as EpochMs;
        Settlement::Retry {
            attempts,
            run_at: now.saturating_add(delay_ms),
            last_error: outcome.stderr_tail.clone(),
            exit_code: outcome.exit_code,
        }
    } else {
        Settlement::Dead {
            attempts,
            last_error: outcome.stderr_tail.clone(),
            exit_code: outcome.exit_code,
        }
    }
}
