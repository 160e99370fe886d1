//! Polite-termination flag. `worker stop` sends SIGTERM; a foreground
//! worker can also be interrupted with Ctrl+C. Either way the handler only
//! raises a flag, and the loop finishes its current job before exiting.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signum: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
pub fn install() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install() -> anyhow::Result<()> {
    // No signal delivery on this platform; the worker only stops when its
    // process is terminated externally.
    Ok(())
}

pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

// The flag is process-global, so loop tests raise and clear it directly
// instead of delivering a real signal.
#[cfg(test)]
pub fn request() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub fn reset() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}
