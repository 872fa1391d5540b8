//! Waiting for and escalating against child processes.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::StopPolicy;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the kernel to reap a child after SIGKILL.
const KILL_REAP_WINDOW: Duration = Duration::from_secs(1);

/// Which stage of a staged stop ended the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the first grace window; no signal was sent.
    Exited,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// Poll `waitpid(WNOHANG)` until the child is reaped or `timeout` passes.
///
/// Returns the wait status if the child was reaped. A child that is not ours
/// (or was already reaped elsewhere) counts as gone, with no status.
pub(crate) fn timed_waitpid(pid: Pid, timeout: Duration) -> Option<Option<WaitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => return Some(Some(status)),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Some(None),
            Err(errno) => {
                warn!(%pid, %errno, "waitpid failed");
                return Some(None);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Staged stop of a child whose control channel has already been closed:
/// grace window, SIGTERM, grace window, SIGKILL.
pub(crate) fn escalate(pid: Pid, policy: &StopPolicy) -> StopOutcome {
    if timed_waitpid(pid, policy.exit_grace).is_some() {
        return StopOutcome::Exited;
    }

    debug!(%pid, grace_ms = policy.exit_grace.as_millis() as u64, "Child did not exit, sending SIGTERM");
    let _ = signal::kill(pid, Signal::SIGTERM);
    if timed_waitpid(pid, policy.term_grace).is_some() {
        return StopOutcome::Terminated;
    }

    warn!(%pid, "Child ignored SIGTERM, sending SIGKILL");
    let _ = signal::kill(pid, Signal::SIGKILL);
    if timed_waitpid(pid, KILL_REAP_WINDOW).is_none() {
        warn!(%pid, "Child not reaped after SIGKILL");
    }
    StopOutcome::Killed
}

/// Make sure a child that failed to start is gone and reaped.
pub(crate) fn discard(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = timed_waitpid(pid, KILL_REAP_WINDOW);
}
