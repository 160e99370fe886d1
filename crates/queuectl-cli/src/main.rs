use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use queuectl_core::{now_ms, ConfigKey, Job, JobState};
use queuectl_store::{JobStore, StoreError};
use queuectl_worker::Registry;

mod supervisor;

#[derive(Parser)]
#[command(name = "queuectl", version, about = "CLI-driven background job queue")]
struct Cli {
    /// Path to the queue database.
    #[arg(long, global = true, default_value = "queue.db")]
    db: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a job to the queue: a JSON object with "id" and "command".
    Enqueue { job_json: String },

    /// Show job counts per state and the number of live workers.
    Status,

    /// List jobs, optionally filtered by state.
    List {
        /// pending, processing, completed or dead.
        #[arg(long)]
        state: Option<String>,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },

    /// Manage the worker fleet.
    Worker {
        #[command(subcommand)]
        cmd: WorkerCmd,
    },

    /// Inspect and replay the dead letter queue.
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Set a configuration value (max_retries, backoff_base).
    Set { key: String, value: String },
    /// Print a configuration value.
    Get { key: String },
}

#[derive(Subcommand)]
enum WorkerCmd {
    /// Start workers in the background.
    Start {
        /// Number of workers to start.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },
    /// Signal all registered workers to drain and exit.
    Stop,
    /// The worker process entry point used by `start`.
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand)]
enum DlqCmd {
    /// List jobs whose retry budget is exhausted.
    List,
    /// Re-queue a dead job with a fresh retry budget.
    Retry { id: String },
}

/// The enqueue payload: exactly two required string fields, anything
/// else is rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    id: String,
    command: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Enqueue { job_json } => {
            let req: EnqueueRequest = serde_json::from_str(&job_json)
                .context("invalid job JSON: expected {\"id\": \"...\", \"command\": \"...\"}")?;
            if req.id.is_empty() || req.command.is_empty() {
                bail!("job JSON fields \"id\" and \"command\" must be non-empty");
            }
            let store = JobStore::open(&cli.db)?;
            store.create_job(&req.id, &req.command, now_ms())?;
            println!("Job {} enqueued.", req.id);
        }

        Command::Status => {
            let store = JobStore::open(&cli.db)?;
            let summary = store.summary()?;
            let active = Registry::open_default().live_pids().len();
            println!("--- Job Status Summary ---");
            println!("Pending:    {}", summary.pending);
            println!("Processing: {}", summary.processing);
            println!("Completed:  {}", summary.completed);
            println!("Dead (DLQ): {}", summary.dead);
            println!();
            println!("--- Worker Status ---");
            println!("Active Workers: {active}");
        }

        Command::List { state } => {
            let store = JobStore::open(&cli.db)?;
            let jobs = match state.as_deref() {
                Some(s) => {
                    let state = JobState::parse(s)
                        .with_context(|| format!("unknown state filter {s:?} (expected pending, processing, completed or dead)"))?;
                    println!("--- Jobs in '{}' state ---", state.as_str());
                    store.list_by_state(state)?
                }
                None => {
                    println!("--- All Jobs ---");
                    store.list_all()?
                }
            };
            if jobs.is_empty() {
                println!("No jobs found.");
            }
            for job in jobs {
                println!(
                    "ID: {} | State: {} | Attempts: {} | Command: {}",
                    job.id,
                    job.state.as_str(),
                    job.attempts,
                    job.command
                );
            }
        }

        Command::Config { cmd } => {
            let store = JobStore::open(&cli.db)?;
            match cmd {
                ConfigCmd::Set { key, value } => {
                    store.config_set(&key, &value)?;
                    println!("Config '{key}' set to '{value}'.");
                }
                ConfigCmd::Get { key } => {
                    let key = ConfigKey::parse(&key)?;
                    match store.config_get(key)? {
                        Some(value) => println!("{} = {value}", key.as_str()),
                        None => bail!("config key '{}' not found", key.as_str()),
                    }
                }
            }
        }

        Command::Worker { cmd } => match cmd {
            WorkerCmd::Start { count } => {
                // Make sure the store exists before the fleet races to it.
                JobStore::open(&cli.db)?;
                let registry = Registry::open_default();
                let pids = supervisor::start_workers(&cli.db, count, &registry)?;
                println!("Started {} worker(s) with PIDs: {pids:?}", pids.len());
            }
            WorkerCmd::Stop => {
                let results = supervisor::stop_workers(&Registry::open_default());
                if results.is_empty() {
                    println!("No active workers found.");
                }
                for (pid, delivered) in results {
                    if delivered {
                        println!("Sent stop signal to worker {pid}.");
                    } else {
                        println!("Worker {pid} already stopped.");
                    }
                }
            }
            WorkerCmd::Run => {
                queuectl_worker::run(&cli.db, &Registry::open_default())?;
            }
        },

        Command::Dlq { cmd } => {
            let store = JobStore::open(&cli.db)?;
            match cmd {
                DlqCmd::List => {
                    let jobs = store.list_by_state(JobState::Dead)?;
                    if jobs.is_empty() {
                        println!("DLQ is empty.");
                    } else {
                        println!("--- Dead Letter Queue ---");
                        for job in jobs {
                            println!("{}", dlq_line(&job));
                        }
                    }
                }
                DlqCmd::Retry { id } => match store.dlq_requeue(&id, now_ms()) {
                    Ok(()) => println!("Job {id} has been re-queued from DLQ."),
                    Err(StoreError::NotInState { .. }) => {
                        bail!("job {id} is not in the dead letter queue")
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    Ok(())
}

fn dlq_line(job: &Job) -> String {
    let exit = job
        .exit_code
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    let error = job.last_error.as_deref().unwrap_or("-");
    format!(
        "ID: {} | Attempts: {} | Exit: {} | Command: {} | Last error: {}",
        job.id, job.attempts, exit, job.command, error
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_json_parses_the_two_required_fields() {
        let req: EnqueueRequest =
            serde_json::from_str(r#"{"id":"job1","command":"echo hello"}"#).unwrap();
        assert_eq!(req.id, "job1");
        assert_eq!(req.command, "echo hello");
    }

    #[test]
    fn enqueue_json_rejects_unknown_fields() {
        let res: std::result::Result<EnqueueRequest, _> =
            serde_json::from_str(r#"{"id":"j","command":"true","priority":3}"#);
        assert!(res.is_err());
    }

    #[test]
    fn enqueue_json_rejects_missing_or_mistyped_fields() {
        assert!(serde_json::from_str::<EnqueueRequest>(r#"{"id":"j"}"#).is_err());
        assert!(serde_json::from_str::<EnqueueRequest>(r#"{"command":"true"}"#).is_err());
        assert!(serde_json::from_str::<EnqueueRequest>(r#"{"id":1,"command":"true"}"#).is_err());
        assert!(serde_json::from_str::<EnqueueRequest>("not json").is_err());
    }

    #[test]
    fn cli_tree_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
