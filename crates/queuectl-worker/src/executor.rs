use std::process::Command;

use queuectl_core::ExecOutcome;
use tracing::debug;

/// Upper bound on the stderr text persisted as `last_error`.
pub const STDERR_LIMIT: usize = 4096;

/// Exit code reported when the command could not be launched at all, the
/// same value a shell reports for an unknown binary.
pub const LAUNCH_FAILURE_EXIT: i32 = 127;

/// Runs the job's command line through a shell so pipes and redirection
/// behave as the user wrote them. Never errors: a failure to launch is
/// itself an outcome the retry machinery handles.
pub fn run_shell(command: &str) -> ExecOutcome {
    match shell_command(command).output() {
        Ok(out) => {
            let exit_code = out.status.code().unwrap_or(1);
            debug!(exit_code, "command finished");
            ExecOutcome {
                exit_code,
                stderr_tail: stderr_tail(&out.stderr),
            }
        }
        Err(e) => ExecOutcome {
            exit_code: LAUNCH_FAILURE_EXIT,
            stderr_tail: Some(format!("failed to launch command: {e}")),
        },
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

fn stderr_tail(stderr: &[u8]) -> Option<String> {
    if stderr.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    let mut tail = trimmed.to_string();
    if tail.len() > STDERR_LIMIT {
        // Truncate on a char boundary at or below the limit.
        let mut cut = STDERR_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut -= 1;
        }
        tail.truncate(cut);
    }
    Some(tail)
}
