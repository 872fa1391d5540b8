//! Forked message-dispatching servers.
//!
//! A [`ServerProcess`] forks a child that runs a [`Server`] main loop: read
//! one array message from the control channel, look its first element up
//! in the server's [`HandlerTable`], run the handler, repeat. The parent
//! keeps the other end of the channel and talks to the child through
//! [`ServerProcess::with_channel`].
//!
//! ```text
//!   parent                                   child
//!   ──────                                   ─────
//!   start() ── socketpair, before_fork, fork ──▶ close fds, reset signals
//!                                              initialize_server
//!   with_channel(|ch| ...) ◀── messages ─────▶ main loop ─▶ handlers
//!   stop() ── close channel ─────────────────▶ EOF ─▶ finalize_server, _exit
//!          ── SIGTERM / SIGKILL if it lingers
//! ```

pub(crate) mod fds;
pub(crate) mod proc;
pub(crate) mod signals;

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::config::StopPolicy;
use crate::error::{Error, Result};
use crate::registry::IdleResource;

pub use proc::StopOutcome;
pub use signals::{TerminationReason, analyze_wait_status};

/// A typed request decoded from an array message.
pub trait Request: Sized {
    /// Decode the message whose discriminator is `name` and whose remaining
    /// elements are `args`.
    fn decode(name: &str, args: &[String]) -> Result<Self>;

    /// Encode back into array-message elements, discriminator first.
    fn encode(&self) -> Vec<String>;
}

/// Handler for one message kind.
pub type Handler<S, R> = fn(&mut S, &mut Channel, R) -> Result<()>;

/// Registration table from message discriminator to handler.
pub struct HandlerTable<S, R> {
    handlers: HashMap<&'static str, Handler<S, R>>,
}

impl<S, R: Request> HandlerTable<S, R> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, name: &'static str, handler: Handler<S, R>) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Route one received message. An empty message or an unregistered
    /// discriminator is an error.
    pub fn dispatch(&self, server: &mut S, channel: &mut Channel, message: &[String]) -> Result<()> {
        let Some((name, args)) = message.split_first() else {
            return Err(Error::Protocol("received an empty message".to_string()));
        };
        let handler = self
            .handlers
            .get(name.as_str())
            .ok_or_else(|| Error::UnknownMessage(name.clone()))?;
        let request = R::decode(name, args)?;
        handler(server, channel, request)
    }
}

impl<S, R: Request> Default for HandlerTable<S, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Behaviour run inside a server child.
pub trait Server: Sized + Send + 'static {
    type Request: Request;

    fn handlers(&self) -> HandlerTable<Self, Self::Request>;

    /// Extra signal handlers, applied on top of the main loop's SIGHUP,
    /// SIGTERM and SIGINT dispositions and reverted when it ends.
    fn signal_handlers(&self) -> Vec<(Signal, SigHandler)> {
        Vec::new()
    }

    /// Runs in the parent right before `fork`.
    fn before_fork(&mut self) {}

    /// Runs before the main loop. May talk to the peer.
    fn initialize_server(&mut self, _channel: &mut Channel) -> Result<()> {
        Ok(())
    }

    /// Runs after the main loop, whatever ended it, and also after a failed
    /// `initialize_server`.
    fn finalize_server(&mut self) {}

    /// A read was interrupted by a signal that is not a shutdown request.
    fn on_signal_wakeup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Why a server main loop ended.
#[derive(Debug)]
pub enum ShutdownReason {
    /// The peer closed the control channel.
    PeerClosed,
    /// SIGINT.
    Interrupted,
    /// SIGTERM.
    TerminationRequested,
    /// A handler or hook failed, or the peer sent something undecodable.
    HandlerError(Error),
}

impl ShutdownReason {
    /// Exit status for a forked child ending this way.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HandlerError(_) => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the channel"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::TerminationRequested => write!(f, "termination requested"),
            Self::HandlerError(e) => write!(f, "handler failed: {}", e),
        }
    }
}

enum State {
    NotStarted,
    Started { pid: Pid, channel: Channel },
    Stopped,
}

struct Inner<S> {
    server: S,
    state: State,
}

/// A [`Server`] running in a forked child, owned by the parent.
pub struct ServerProcess<S: Server> {
    inner: Mutex<Inner<S>>,
    stop_policy: StopPolicy,
    max_idle_time: Option<Duration>,
}

impl<S: Server> ServerProcess<S> {
    pub fn new(server: S) -> Self {
        Self {
            inner: Mutex::new(Inner {
                server,
                state: State::NotStarted,
            }),
            stop_policy: StopPolicy::default(),
            max_idle_time: None,
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    /// Idle budget used when this server lives in an idle registry.
    /// `None` or zero means it is never evicted.
    pub fn with_max_idle_time(mut self, idle: Option<Duration>) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        matches!(self.lock().state, State::Started { .. })
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.lock().state {
            State::Started { pid, .. } => Some(pid),
            _ => None,
        }
    }

    /// Fork the child and return its pid without waiting for it.
    pub fn start(&self) -> Result<Pid> {
        let mut inner = self.lock();
        match inner.state {
            State::NotStarted => {}
            State::Started { .. } => return Err(Error::ServerAlreadyStarted),
            State::Stopped => return Err(Error::ServerStopped),
        }

        let (parent_end, child_end) = UnixStream::pair()?;
        inner.server.before_fork();

        // SAFETY: the child only runs the server and then `_exit`s; it never
        // returns into the caller's stack.
        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(parent_end);
                let code = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_forked_child(&mut inner.server, child_end)
                }))
                .unwrap_or(1);
                // SAFETY: terminate without running the parent's destructors
                // or atexit handlers.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                inner.state = State::Started {
                    pid: child,
                    channel: Channel::new(parent_end),
                };
                debug!(pid = %child, "Server process started");
                Ok(child)
            }
        }
    }

    /// Run the server in the calling thread over `endpoint`, without
    /// forking, and return once its main loop ends.
    ///
    /// Only the main loop's own signal dispositions are installed, and they
    /// are restored on return; the rest of the host process keeps its
    /// handlers.
    pub fn start_synchronously(&self, endpoint: UnixStream) -> Result<ShutdownReason> {
        let mut inner = self.lock();
        match inner.state {
            State::NotStarted => {}
            State::Started { .. } => return Err(Error::ServerAlreadyStarted),
            State::Stopped => return Err(Error::ServerStopped),
        }
        let reason = serve(&mut inner.server, endpoint);
        inner.state = State::Stopped;
        reason
    }

    /// Close the control channel and wait for the child, escalating to
    /// SIGTERM and then SIGKILL if it lingers.
    pub fn stop(&self) -> Result<StopOutcome> {
        let mut inner = self.lock();
        let (pid, channel) = match std::mem::replace(&mut inner.state, State::Stopped) {
            State::Started { pid, channel } => (pid, channel),
            previous => {
                inner.state = previous;
                return Err(Error::ServerNotStarted);
            }
        };
        drop(channel);
        let outcome = proc::escalate(pid, &self.stop_policy);
        debug!(%pid, ?outcome, "Server process stopped");
        Ok(outcome)
    }

    /// Run `f` with exclusive use of the control channel. Concurrent callers
    /// and `stop` wait until it returns.
    pub fn with_channel<T>(&self, f: impl FnOnce(&mut Channel) -> Result<T>) -> Result<T> {
        let mut inner = self.lock();
        match inner.state {
            State::Started {
                ref mut channel, ..
            } => f(channel),
            State::NotStarted => Err(Error::ServerNotStarted),
            State::Stopped => Err(Error::ServerStopped),
        }
    }
}

impl<S: Server> Drop for ServerProcess<S> {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop();
        }
    }
}

impl<S: Server> IdleResource for ServerProcess<S> {
    fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    fn is_started(&self) -> bool {
        ServerProcess::is_started(self)
    }

    fn stop(&self) -> Result<()> {
        ServerProcess::stop(self).map(|_| ())
    }
}

fn run_forked_child<S: Server>(server: &mut S, endpoint: UnixStream) -> i32 {
    fds::close_all_except(&[0, 1, 2, endpoint.as_raw_fd()]);
    if let Err(e) = signals::reset_for_server() {
        error!(error = %e, "Could not reset signal dispositions");
        return 1;
    }
    match serve(server, endpoint) {
        Ok(ShutdownReason::HandlerError(e)) => {
            error!(error = %e, "Server main loop failed");
            1
        }
        Ok(reason) => {
            trace!(%reason, "Server main loop finished");
            reason.exit_code()
        }
        Err(e) => {
            error!(error = %e, "Server failed to initialize");
            1
        }
    }
}

/// Full server lifecycle over one endpoint.
fn serve<S: Server>(server: &mut S, endpoint: UnixStream) -> Result<ShutdownReason> {
    let mut channel = Channel::new(endpoint);
    let handlers = server.handlers();

    let guard = signals::SignalGuard::install(&server.signal_handlers())?;
    let result = server
        .initialize_server(&mut channel)
        .map(|()| main_loop(server, &mut channel, &handlers));
    drop(guard);

    server.finalize_server();
    result
}

fn main_loop<S: Server>(
    server: &mut S,
    channel: &mut Channel,
    handlers: &HandlerTable<S, S::Request>,
) -> ShutdownReason {
    loop {
        if let Some(reason) = signals::take_shutdown_request() {
            return reason;
        }
        match channel.read_interruptible() {
            Ok(Some(message)) => {
                trace!(message = ?message.first(), "Dispatching");
                if let Err(e) = handlers.dispatch(server, channel, &message) {
                    return ShutdownReason::HandlerError(e);
                }
            }
            Ok(None) => return ShutdownReason::PeerClosed,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                if let Some(reason) = signals::take_shutdown_request() {
                    return reason;
                }
                if let Err(e) = server.on_signal_wakeup() {
                    return ShutdownReason::HandlerError(e);
                }
            }
            Err(e) => return ShutdownReason::HandlerError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    enum EchoRequest {
        Ping(Vec<String>),
        Pid,
    }

    impl Request for EchoRequest {
        fn decode(name: &str, args: &[String]) -> Result<Self> {
            match name {
                "ping" => Ok(Self::Ping(args.to_vec())),
                "pid" => Ok(Self::Pid),
                other => Err(Error::UnknownMessage(other.to_string())),
            }
        }

        fn encode(&self) -> Vec<String> {
            match self {
                Self::Ping(args) => std::iter::once("ping".to_string())
                    .chain(args.iter().cloned())
                    .collect(),
                Self::Pid => vec!["pid".to_string()],
            }
        }
    }

    /// Echo server. `linger` makes finalize_server sleep forever, optionally
    /// with SIGTERM ignored.
    struct Echo {
        linger: Option<bool>,
        greeting: &'static str,
        forks: Arc<AtomicUsize>,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                linger: None,
                greeting: "ready",
                forks: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn handle_ping(&mut self, channel: &mut Channel, request: EchoRequest) -> Result<()> {
            let EchoRequest::Ping(args) = request else {
                return Err(Error::Protocol("expected ping".to_string()));
            };
            let mut reply = vec!["pong".to_string()];
            reply.extend(args);
            channel.write(&reply)
        }

        fn handle_pid(&mut self, channel: &mut Channel, _: EchoRequest) -> Result<()> {
            channel.write(&[std::process::id().to_string()])
        }
    }

    impl Server for Echo {
        type Request = EchoRequest;

        fn handlers(&self) -> HandlerTable<Self, EchoRequest> {
            HandlerTable::new()
                .register("ping", Self::handle_ping)
                .register("pid", Self::handle_pid)
        }

        fn before_fork(&mut self) {
            self.forks.fetch_add(1, Ordering::SeqCst);
        }

        fn initialize_server(&mut self, channel: &mut Channel) -> Result<()> {
            channel.write(&[self.greeting])
        }

        fn finalize_server(&mut self) {
            if let Some(ignore_term) = self.linger {
                if ignore_term {
                    // SAFETY: installs SIG_IGN only.
                    unsafe {
                        let _ = nix::sys::signal::signal(Signal::SIGTERM, SigHandler::SigIgn);
                    }
                }
                loop {
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    fn quick_policy() -> StopPolicy {
        StopPolicy::new(Duration::from_millis(300), Duration::from_millis(300))
    }

    fn expect_greeting(process: &ServerProcess<Echo>) {
        let greeting = process.with_channel(|ch| ch.read()).unwrap();
        assert_eq!(greeting, Some(vec!["ready".to_string()]));
    }

    #[test]
    fn test_request_roundtrip_through_forked_child() {
        let process = ServerProcess::new(Echo::new()).with_stop_policy(quick_policy());
        let pid = process.start().unwrap();
        expect_greeting(&process);

        let reply = process
            .with_channel(|ch| {
                ch.write(&EchoRequest::Ping(vec!["a".into(), "".into()]).encode())?;
                ch.read()
            })
            .unwrap()
            .unwrap();
        assert_eq!(reply, vec!["pong", "a", ""]);

        let child_pid = process
            .with_channel(|ch| {
                ch.write(&EchoRequest::Pid.encode())?;
                ch.read()
            })
            .unwrap()
            .unwrap();
        assert_eq!(child_pid, vec![pid.to_string()]);

        assert_eq!(process.stop().unwrap(), StopOutcome::Exited);
        assert!(!process.is_started());
    }

    #[test]
    fn test_state_machine_errors() {
        let process = ServerProcess::new(Echo::new()).with_stop_policy(quick_policy());
        assert!(matches!(process.stop(), Err(Error::ServerNotStarted)));
        assert!(matches!(
            process.with_channel(|_| Ok(())),
            Err(Error::ServerNotStarted)
        ));

        process.start().unwrap();
        assert!(matches!(process.start(), Err(Error::ServerAlreadyStarted)));
        process.stop().unwrap();

        assert!(matches!(process.start(), Err(Error::ServerStopped)));
        assert!(matches!(process.stop(), Err(Error::ServerNotStarted)));
    }

    #[test]
    fn test_unknown_message_ends_child_with_error() {
        let process = ServerProcess::new(Echo::new()).with_stop_policy(quick_policy());
        let pid = process.start().unwrap();
        expect_greeting(&process);

        let eof = process
            .with_channel(|ch| {
                ch.write(&["frobnicate"])?;
                ch.read()
            })
            .unwrap();
        assert_eq!(eof, None);

        let status = proc::timed_waitpid(pid, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            status,
            Some(nix::sys::wait::WaitStatus::Exited(_, 1))
        ));
    }

    #[test]
    fn test_cooperative_child_gets_no_signal() {
        let process = ServerProcess::new(Echo::new())
            .with_stop_policy(StopPolicy::new(Duration::from_secs(5), Duration::from_secs(5)));
        process.start().unwrap();
        expect_greeting(&process);

        let started = Instant::now();
        assert_eq!(process.stop().unwrap(), StopOutcome::Exited);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_lingering_child_is_terminated() {
        let mut echo = Echo::new();
        echo.linger = Some(false);
        let process = ServerProcess::new(echo).with_stop_policy(quick_policy());
        process.start().unwrap();
        expect_greeting(&process);

        let started = Instant::now();
        assert_eq!(process.stop().unwrap(), StopOutcome::Terminated);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_child_ignoring_sigterm_is_killed() {
        let mut echo = Echo::new();
        echo.linger = Some(true);
        let process = ServerProcess::new(echo).with_stop_policy(quick_policy());
        process.start().unwrap();
        expect_greeting(&process);

        let started = Instant::now();
        assert_eq!(process.stop().unwrap(), StopOutcome::Killed);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[test]
    fn test_dispatch_rejects_empty_and_unknown() {
        let table: HandlerTable<Echo, EchoRequest> = Echo::new().handlers();
        assert!(table.contains("ping"));
        assert!(!table.contains("status"));

        let (mut a, _b) = Channel::pair().unwrap();
        let mut echo = Echo::new();
        assert!(matches!(
            table.dispatch(&mut echo, &mut a, &[]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            table.dispatch(&mut echo, &mut a, &["status".to_string()]),
            Err(Error::UnknownMessage(name)) if name == "status"
        ));
    }

    extern "C" fn ignore_usr2(_: libc::c_int) {}

    /// The disposition currently installed for `signal`.
    fn disposition(signal: Signal) -> libc::sighandler_t {
        // SAFETY: a null `act` only queries the current disposition.
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(signal as libc::c_int, std::ptr::null(), &mut current);
            current.sa_sigaction
        }
    }

    /// Records its lifecycle for in-process runs and reports the signal
    /// dispositions it sees while serving.
    struct Recorder {
        events: Arc<Mutex<Vec<&'static str>>>,
        fail_init: bool,
    }

    impl Recorder {
        fn record(&self, event: &'static str) {
            self.events.lock().unwrap().push(event);
        }

        fn handle_ping(&mut self, channel: &mut Channel, _: EchoRequest) -> Result<()> {
            self.record("ping");
            channel.write(&[
                disposition(Signal::SIGPIPE).to_string(),
                disposition(Signal::SIGUSR2).to_string(),
            ])
        }
    }

    impl Server for Recorder {
        type Request = EchoRequest;

        fn handlers(&self) -> HandlerTable<Self, EchoRequest> {
            HandlerTable::new().register("ping", Self::handle_ping)
        }

        fn signal_handlers(&self) -> Vec<(Signal, SigHandler)> {
            vec![(Signal::SIGUSR2, SigHandler::Handler(ignore_usr2))]
        }

        fn initialize_server(&mut self, _channel: &mut Channel) -> Result<()> {
            self.record("initialize");
            if self.fail_init {
                return Err(Error::Protocol("init failed".to_string()));
            }
            Ok(())
        }

        fn finalize_server(&mut self) {
            self.record("finalize");
        }
    }

    #[test]
    fn test_start_synchronously_serves_in_process() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let process = ServerProcess::new(Recorder {
            events: Arc::clone(&events),
            fail_init: false,
        });
        let pipe_before = disposition(Signal::SIGPIPE);
        let usr2_before = disposition(Signal::SIGUSR2);

        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || process.start_synchronously(theirs));

        let mut channel = Channel::new(ours);
        channel.write(&EchoRequest::Ping(Vec::new()).encode()).unwrap();
        let seen = channel.read().unwrap().unwrap();
        // The host keeps its SIGPIPE disposition; the server's own
        // handler is in place while it serves.
        assert_eq!(seen[0], pipe_before.to_string());
        assert_eq!(seen[1], (ignore_usr2 as libc::sighandler_t).to_string());
        drop(channel);

        let reason = server.join().unwrap().unwrap();
        assert!(matches!(reason, ShutdownReason::PeerClosed));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["initialize", "ping", "finalize"]
        );
        assert_eq!(disposition(Signal::SIGUSR2), usr2_before);
        assert_eq!(disposition(Signal::SIGPIPE), pipe_before);
    }

    #[test]
    fn test_failed_initialize_still_finalizes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let process = ServerProcess::new(Recorder {
            events: Arc::clone(&events),
            fail_init: true,
        });
        let (_ours, theirs) = UnixStream::pair().unwrap();

        assert!(matches!(
            process.start_synchronously(theirs),
            Err(Error::Protocol(_))
        ));
        assert_eq!(*events.lock().unwrap(), vec!["initialize", "finalize"]);
        assert!(matches!(process.start(), Err(Error::ServerStopped)));
    }

    #[test]
    fn test_sigterm_during_main_loop_is_clean_shutdown() {
        let process = ServerProcess::new(Echo::new()).with_stop_policy(quick_policy());
        let pid = process.start().unwrap();
        // The greeting is written after the handlers are installed.
        expect_greeting(&process);

        nix::sys::signal::kill(pid, Signal::SIGTERM).unwrap();
        let status = proc::timed_waitpid(pid, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            status,
            Some(nix::sys::wait::WaitStatus::Exited(_, 0))
        ));
        assert_eq!(process.with_channel(|ch| ch.read()).unwrap(), None);
    }

    #[test]
    fn test_before_fork_runs_once_in_parent() {
        let echo = Echo::new();
        let forks = Arc::clone(&echo.forks);
        let process = ServerProcess::new(echo).with_stop_policy(quick_policy());
        assert_eq!(forks.load(Ordering::SeqCst), 0);

        process.start().unwrap();
        assert_eq!(forks.load(Ordering::SeqCst), 1);
        expect_greeting(&process);
        process.stop().unwrap();
        assert_eq!(forks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_reason_exit_codes() {
        assert_eq!(ShutdownReason::PeerClosed.exit_code(), 0);
        assert_eq!(ShutdownReason::Interrupted.exit_code(), 0);
        assert_eq!(ShutdownReason::TerminationRequested.exit_code(), 0);
        assert_eq!(
            ShutdownReason::HandlerError(Error::RegistryClosed).exit_code(),
            1
        );
    }
}
