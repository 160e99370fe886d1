//! On-disk worker registry: one `<pid>.pid` file per live worker under a
//! well-known temp directory. Advisory only; the OS process table is the
//! source of truth, and stale files are reaped whenever the registry is
//! read for liveness.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use queuectl_core::now_ms;
use tracing::debug;

pub const REGISTRY_DIR_NAME: &str = "queuectl_pids";

#[derive(Clone, Debug)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// The per-user default location, shared by workers and the CLI.
    pub fn open_default() -> Self {
        Self {
            dir: std::env::temp_dir().join(REGISTRY_DIR_NAME),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Drops a registry file for `pid`. Content is informational; the
    /// file name is what identifies the process.
    pub fn register(&self, pid: u32) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating registry dir {}", self.dir.display()))?;
        let path = self.entry_path(pid);
        std::fs::write(&path, format!("pid={pid}\nstarted_at_ms={}\n", now_ms()))
            .with_context(|| format!("writing registry entry {}", path.display()))?;
        Ok(path)
    }

    /// Removes the entry for `pid`; a missing file is fine.
    pub fn deregister(&self, pid: u32) {
        let _ = std::fs::remove_file(self.entry_path(pid));
    }

    /// All registered pids, live or not.
    pub fn pids(&self) -> Vec<u32> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // No directory means no workers were ever started.
            Err(_) => return Vec::new(),
        };
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                Some(pid) => pids.push(pid),
                None => {
                    // Unparseable name: junk, drop it.
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        pids.sort_unstable();
        pids
    }

    /// Registered pids whose process still exists. Entries for vanished
    /// processes are unlinked on the way through.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut live = Vec::new();
        for pid in self.pids() {
            if process_alive(pid) {
                live.push(pid);
            } else {
                debug!(pid, "reaping stale registry entry");
                self.deregister(pid);
            }
        }
        live
    }

    fn entry_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{pid}.pid"))
    }
}

/// Existence probe without delivering a signal: `kill(pid, 0)`. EPERM
/// still means the process exists, just owned by someone else.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_list_deregister() {
        let dir = tempdir().unwrap();
        let registry = Registry::with_dir(dir.path().join("pids"));
        assert!(registry.pids().is_empty());

        registry.register(101).unwrap();
        registry.register(7).unwrap();
        assert_eq!(registry.pids(), vec![7, 101]);

        registry.deregister(7);
        assert_eq!(registry.pids(), vec![101]);
        // Double deregister is harmless.
        registry.deregister(7);
    }

    #[test]
    fn non_pid_files_are_ignored_and_removed() {
        let dir = tempdir().unwrap();
        let registry = Registry::with_dir(dir.path());
        registry.register(55).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        std::fs::write(dir.path().join("garbage.pid"), "").unwrap();

        assert_eq!(registry.pids(), vec![55]);
        // The unparseable .pid file was dropped, the unrelated file kept.
        assert!(!dir.path().join("garbage.pid").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_pids_reaps_dead_processes() {
        let dir = tempdir().unwrap();
        let registry = Registry::with_dir(dir.path());
        let own_pid = std::process::id();
        registry.register(own_pid).unwrap();
        // High enough that no real process has it.
        registry.register(3_999_999).unwrap();

        assert_eq!(registry.live_pids(), vec![own_pid]);
        assert_eq!(registry.pids(), vec![own_pid]);
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(3_999_998));
    }
}
