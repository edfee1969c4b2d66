//! `SIGUSR1` ("isolation lost") and `SIGPIPE` handling (spec.md §6).
//!
//! The handler body is kept to the minimum spec.md's Design Notes
//! demand: identify the current thread's worker via the thread-local
//! slot in [`crate::tls`], then a single SeqCst store. No allocation, no
//! logging, no reentrant-unsafe platform calls.

use isol_core::error::{IsolResult, PlatformError};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigusr1(_signum: libc::c_int) {
    crate::tls::signal_mark_isolation_lost();
}

/// Install the `SIGUSR1` handler and ignore `SIGPIPE` process-wide.
/// Idempotent; safe to call more than once.
pub fn install() -> IsolResult<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let action = SigAction::new(SigHandler::Handler(handle_sigusr1), SaFlags::SA_RESTART, SigSet::empty());
    // Safety: `handle_sigusr1` only touches thread-local state and an
    // atomic store, both async-signal-safe.
    unsafe {
        signal::sigaction(Signal::SIGUSR1, &action)
            .map_err(|_| PlatformError::SignalInstallFailed)?;
    }

    // Safety: SIG_IGN is a well-known sentinel, not a real handler.
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(|_| PlatformError::SignalInstallFailed)?;
    }

    Ok(())
}

/// Send `SIGUSR1` to a specific OS thread (used by tests that simulate
/// involuntary isolation loss without a real kernel feature backing it).
pub fn send_to_thread(tid: libc::pthread_t) -> IsolResult<()> {
    let rc = unsafe { libc::pthread_kill(tid, libc::SIGUSR1) };
    if rc != 0 {
        return Err(PlatformError::Other("pthread_kill failed".into()).into());
    }
    Ok(())
}
