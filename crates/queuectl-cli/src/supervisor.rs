//! Fleet supervision: spawn detached worker processes and signal them for
//! graceful shutdown through the PID registry. The supervisor never waits
//! for workers; they drain their current job and exit on their own.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use queuectl_worker::Registry;
use tracing::{info, warn};

/// Spawns `count` detached workers running this same binary's hidden
/// `worker run` entry point, and records their PIDs in the registry.
pub fn start_workers(db_path: &Path, count: u32, registry: &Registry) -> Result<Vec<u32>> {
    let exe = std::env::current_exe().context("locating the queuectl binary")?;
    let mut pids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut cmd = Command::new(&exe);
        cmd.arg("--db")
            .arg(db_path)
            .args(["worker", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            // Own process group: a Ctrl+C aimed at the CLI must not reach
            // the fleet.
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().context("spawning worker process")?;
        let pid = child.id();
        registry.register(pid)?;
        info!(pid, "spawned worker");
        pids.push(pid);
    }
    Ok(pids)
}

/// Signals every registered worker and unlinks its registry entry.
/// Returns each pid with whether a signal was actually delivered; a
/// vanished process is not an error, its stale entry just gets reaped.
pub fn stop_workers(registry: &Registry) -> Vec<(u32, bool)> {
    let mut results = Vec::new();
    for pid in registry.pids() {
        let delivered = send_term(pid);
        registry.deregister(pid);
        results.push((pid, delivered));
    }
    results
}

#[cfg(unix)]
fn send_term(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "failed to signal worker");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_term(_pid: u32) -> bool {
    false
}
