//! Forking a single worker and bootstrapping it through the handshake.
//!
//! The forked side closes inherited descriptors, resets its signals, takes
//! the handshake, exports the passed environment, drops root if asked to,
//! has the [`Loader`] load the application and then serves until its owner
//! pipe is released. With `detach` set the direct
//! child forks once more and exits immediately, so the worker is reparented
//! to init and never lingers as a zombie of the spawner.

use std::os::unix::io::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use nix::unistd::{ForkResult, Pid, fork, getpid};
use tracing::{debug, error, warn};

use super::application::Application;
use super::handshake::{self, HandshakeError, Outcome};
use super::loader::{BootstrapError, Loader, OwnerPipe};
use super::options::SpawnOptions;
use super::privilege;
use crate::channel::Channel;
use crate::error::{Error, Result, SpawnFailure};
use crate::server::proc;
use crate::server::{analyze_wait_status, fds, signals};

/// The intermediate child of a detached spawn only forks and exits.
const INTERMEDIATE_EXIT_WINDOW: Duration = Duration::from_secs(10);

/// How long a worker that reported a load failure gets to exit by itself.
const FAILED_WORKER_WINDOW: Duration = Duration::from_secs(5);

/// Fork one worker for `options` and return it once it reported ready.
pub(crate) fn spawn_worker(loader: &dyn Loader, options: &SpawnOptions) -> Result<Application> {
    let app_root = options.app_root().to_path_buf();
    let (spawner_end, worker_end) = UnixStream::pair()?;
    loader.collect_garbage();

    // SAFETY: the child runs worker code only and leaves through `_exit`.
    let child = match unsafe { fork() }? {
        ForkResult::Child => {
            drop(spawner_end);
            let code = panic::catch_unwind(AssertUnwindSafe(|| {
                if options.detach {
                    detach_and_run(loader, worker_end)
                } else {
                    run_worker(loader, worker_end)
                }
            }))
            .unwrap_or(1);
            // SAFETY: skip the parent's destructors and atexit handlers.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => child,
    };
    drop(worker_end);

    let direct = if options.detach {
        if proc::timed_waitpid(child, INTERMEDIATE_EXIT_WINDOW).is_none() {
            warn!(pid = %child, "Intermediate spawn process did not exit");
            proc::discard(child);
        }
        None
    } else {
        Some(child)
    };

    let fail = |cause: SpawnFailure| Error::SpawnFailed {
        app_root: app_root.clone(),
        cause,
    };

    match handshake::negotiate(spawner_end, options) {
        Ok(Outcome::Ready(ready)) => {
            debug!(pid = %ready.pid, app_root = %app_root.display(), "Worker ready");
            Application::new(app_root.clone(), ready.pid, ready.sockets, ready.owner_pipe)
        }
        Ok(Outcome::Failed(error)) => {
            if let Some(pid) = direct
                && proc::timed_waitpid(pid, FAILED_WORKER_WINDOW).is_none()
            {
                proc::discard(pid);
            }
            Err(fail(SpawnFailure::Bootstrap(error)))
        }
        Err(HandshakeError::Eof(waiting_for)) => {
            let how = match direct {
                Some(pid) => describe_exit(pid),
                None => "closed its handshake socket".to_string(),
            };
            Err(fail(SpawnFailure::Exited(format!(
                "worker {} while the spawner waited for {}",
                how, waiting_for
            ))))
        }
        Err(HandshakeError::Violation(message)) => {
            if let Some(pid) = direct {
                proc::discard(pid);
            }
            Err(fail(SpawnFailure::Handshake(message)))
        }
        Err(HandshakeError::Io(e)) => {
            let how = match direct {
                Some(pid) => describe_exit(pid),
                None => "went away".to_string(),
            };
            Err(fail(SpawnFailure::Exited(format!(
                "worker {} ({})",
                how, e
            ))))
        }
    }
}

/// Reap a non-detached worker that broke off the handshake and say how it
/// ended.
fn describe_exit(pid: Pid) -> String {
    match proc::timed_waitpid(pid, Duration::from_secs(1)) {
        Some(Some(status)) => analyze_wait_status(status).description(),
        Some(None) => "exited".to_string(),
        None => {
            proc::discard(pid);
            "stopped responding and was killed".to_string()
        }
    }
}

fn detach_and_run(loader: &dyn Loader, stream: UnixStream) -> i32 {
    // SAFETY: as in spawn_worker, the grandchild never returns.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => 0,
        Ok(ForkResult::Child) => run_worker(loader, stream),
        Err(errno) => {
            error!(%errno, "Could not fork detached worker");
            1
        }
    }
}

/// Body of the worker process. Returns its exit status.
fn run_worker(loader: &dyn Loader, stream: UnixStream) -> i32 {
    fds::close_all_except(&[0, 1, 2, stream.as_raw_fd()]);
    if let Err(e) = signals::reset_for_worker() {
        error!(error = %e, "Could not reset worker signal dispositions");
        return 1;
    }

    let options = match handshake::accept(&stream) {
        Ok(options) => options,
        Err(e) => {
            error!(error = ?e, "Worker handshake failed");
            return 1;
        }
    };

    privilege::apply_environment(&options.environment_variables);
    if options.lower_privilege {
        let startup_file = loader.startup_file(options.app_root());
        if let Err(e) = privilege::lower_privilege(&startup_file, &options.lowest_user) {
            return report_load_failure(&stream, &options, e);
        }
    }

    let worker = match loader.load_app(&options) {
        Ok(worker) => worker,
        Err(e) => return report_load_failure(&stream, &options, e),
    };
    let sockets = worker.sockets();
    if sockets.is_empty() {
        let e = BootstrapError::general("application did not report any listen socket");
        return report_load_failure(&stream, &options, e);
    }

    let (reader, writer) = match nix::unistd::pipe() {
        Ok(pair) => pair,
        Err(errno) => {
            let e = BootstrapError::general(format!("could not create owner pipe: {}", errno));
            return report_load_failure(&stream, &options, e);
        }
    };
    if let Err(e) = handshake::report_ready(&stream, getpid(), &sockets) {
        error!(error = ?e, "Could not report worker ready");
        return 1;
    }
    let mut channel = Channel::new(stream);
    if let Err(e) = channel.send_fd_negotiated(writer.as_fd()) {
        error!(error = %e, "Could not hand over owner pipe");
        return 1;
    }
    drop(writer);
    drop(channel);

    match worker.serve(OwnerPipe::new(reader)) {
        Ok(()) => 0,
        Err(e) => {
            error!(app_root = %options.app_root().display(), error = %e, "Worker failed");
            1
        }
    }
}

fn report_load_failure(stream: &UnixStream, options: &SpawnOptions, e: BootstrapError) -> i32 {
    if options.print_exceptions {
        error!(
            app_root = %options.app_root().display(),
            kind = %e.kind,
            error = %e,
            "Application failed to load"
        );
    }
    if let Err(report) = handshake::report_error(stream, &e) {
        error!(error = ?report, "Could not report load failure");
    }
    1
}

/// Spawn a worker straight from the calling process, no preloading.
pub(crate) fn spawn_direct(loader: &dyn Loader, options: &SpawnOptions) -> Result<Application> {
    debug!(app_root = %options.app_root().display(), "Spawning worker directly");
    spawn_worker(loader, options)
}
