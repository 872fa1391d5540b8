//! Signal dispositions inside server children, and analysis of how a child
//! ended.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;
use tracing::trace;

use super::ShutdownReason;
use crate::error::Result;

static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_termination(_: libc::c_int) {
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn request_interrupt(_: libc::c_int) {
    INTERRUPT_REQUESTED.store(true, Ordering::SeqCst);
}

/// Consume a pending SIGTERM/SIGINT, if any. SIGTERM wins when both arrived.
pub(crate) fn take_shutdown_request() -> Option<ShutdownReason> {
    let terminate = TERMINATION_REQUESTED.swap(false, Ordering::SeqCst);
    let interrupt = INTERRUPT_REQUESTED.swap(false, Ordering::SeqCst);
    if terminate {
        Some(ShutdownReason::TerminationRequested)
    } else if interrupt {
        Some(ShutdownReason::Interrupted)
    } else {
        None
    }
}

fn action(handler: SigHandler) -> SigAction {
    // No SA_RESTART: a blocking read must return EINTR so the main loop can
    // look at the flags above.
    SigAction::new(handler, SaFlags::empty(), SigSet::empty())
}

fn catchable() -> impl Iterator<Item = Signal> {
    Signal::iterator().filter(|s| !matches!(s, Signal::SIGKILL | Signal::SIGSTOP))
}

/// Every catchable signal back to its default.
fn reset_all() {
    let default = action(SigHandler::SigDfl);
    for signal in catchable() {
        // SAFETY: installing SIG_DFL runs no code in signal context.
        if let Err(errno) = unsafe { sigaction(signal, &default) } {
            trace!(?signal, %errno, "Signal disposition not reset");
        }
    }
}

fn install(signal: Signal, handler: SigHandler) -> Result<SigAction> {
    // SAFETY: the handlers used in this crate only touch atomics.
    let previous = unsafe { sigaction(signal, &action(handler)) }?;
    Ok(previous)
}

/// Dispositions for a server main loop, restored when dropped.
///
/// Ignores SIGHUP, turns SIGTERM and SIGINT into shutdown requests, then
/// applies the server's own handlers, which may override any of those.
/// Every other disposition of the process is left alone.
pub(crate) struct SignalGuard {
    saved: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    pub(crate) fn install(custom: &[(Signal, SigHandler)]) -> Result<Self> {
        TERMINATION_REQUESTED.store(false, Ordering::SeqCst);
        INTERRUPT_REQUESTED.store(false, Ordering::SeqCst);

        let mut guard = Self { saved: Vec::new() };
        let defaults = [
            (Signal::SIGHUP, SigHandler::SigIgn),
            (Signal::SIGTERM, SigHandler::Handler(request_termination)),
            (Signal::SIGINT, SigHandler::Handler(request_interrupt)),
        ];
        for (signal, handler) in defaults.iter().chain(custom) {
            let previous = install(*signal, *handler)?;
            guard.saved.push((*signal, previous));
        }
        Ok(guard)
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (signal, previous) in self.saved.iter().rev() {
            // SAFETY: restoring a disposition that was in place before.
            let _ = unsafe { sigaction(*signal, previous) };
        }
    }
}

/// A freshly forked server child: empty mask, every disposition back to
/// its default. Nothing is restored; the child owns its dispositions.
pub(crate) fn reset_for_server() -> Result<()> {
    unblock_all()?;
    reset_all();
    Ok(())
}

/// Dispositions for a freshly forked worker: defaults, SIGHUP ignored.
pub(crate) fn reset_for_worker() -> Result<()> {
    reset_for_server()?;
    install(Signal::SIGHUP, SigHandler::SigIgn)?;
    Ok(())
}

/// A forked child inherits the signal mask of the forking thread.
fn unblock_all() -> Result<()> {
    SigSet::all().thread_unblock()?;
    Ok(())
}

/// How a reaped child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal not listed below.
    Signaled(Signal),
    /// SIGKILL, most often the OOM killer.
    OutOfMemory,
    /// SIGSEGV or SIGBUS.
    Crashed(Signal),
    /// SIGABRT, typically a failed assertion or an abort() in native code.
    Aborted,
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig),
            Self::OutOfMemory => "killed by SIGKILL, possibly out of memory".to_string(),
            Self::Crashed(sig) => format!("crashed with {}", sig),
            Self::Aborted => "aborted (SIGABRT)".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Crashed(signal),
            Signal::SIGABRT => TerminationReason::Aborted,
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGUSR1, false)),
            TerminationReason::Signaled(Signal::SIGUSR1)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_descriptions() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Aborted.is_success());
        assert_eq!(
            TerminationReason::Exited(2).to_string(),
            "exited with code 2"
        );
        assert!(
            TerminationReason::Crashed(Signal::SIGBUS)
                .to_string()
                .contains("SIGBUS")
        );
    }

    #[test]
    fn test_pending_flags_are_consumed() {
        TERMINATION_REQUESTED.store(false, Ordering::SeqCst);
        INTERRUPT_REQUESTED.store(false, Ordering::SeqCst);
        assert!(take_shutdown_request().is_none());

        request_interrupt(libc::SIGINT);
        request_termination(libc::SIGTERM);
        assert!(matches!(
            take_shutdown_request(),
            Some(ShutdownReason::TerminationRequested)
        ));
        assert!(take_shutdown_request().is_none());

        request_interrupt(libc::SIGINT);
        assert!(matches!(
            take_shutdown_request(),
            Some(ShutdownReason::Interrupted)
        ));
    }
}
