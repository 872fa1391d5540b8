//! Text handshake between a spawner and a freshly forked worker.
//!
//! ```text
//! spawner                         worker
//!    │ You have control 1.0          │
//!    │──────────────────────────────▶│
//!    │ I have control 1.0            │
//!    │◀──────────────────────────────│
//!    │ name: value ... <blank>       │
//!    │──────────────────────────────▶│   load_app
//!    │ Ready                         │
//!    │ pid: 1234                     │
//!    │ socket: name;addr;proto;conc  │
//!    │ <blank>                       │
//!    │◀──────────────────────────────│
//!    │ owner pipe (negotiated fd)    │
//!    │◀─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │
//! ```
//!
//! On failure the worker answers `Error`, `kind: ...`, `message: ...`, a
//! blank line, then free-form details until it closes the socket.

use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;

use nix::unistd::Pid;

use super::application::ListenEndpoint;
use super::loader::{BootstrapError, BootstrapKind};
use super::options::SpawnOptions;
use crate::channel::{self, Channel};
use crate::error::Error;

pub(crate) const CONTROL_REQUEST: &str = "You have control 1.0";
pub(crate) const CONTROL_REPLY: &str = "I have control 1.0";

/// Longest accepted handshake line, newline included.
pub(crate) const MAX_LINE_SIZE: usize = 4096;

const MAX_DETAILS_SIZE: u64 = 1024 * 1024;

#[derive(Debug)]
pub(crate) enum HandshakeError {
    /// The peer closed the socket while we waited for the named item.
    Eof(&'static str),
    Violation(String),
    Io(io::Error),
}

impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Error> for HandshakeError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => Self::Io(e),
            other => Self::Violation(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, HandshakeError>;

/// What a worker reported after loading successfully.
#[derive(Debug)]
pub(crate) struct Ready {
    pub(crate) pid: Pid,
    pub(crate) sockets: Vec<ListenEndpoint>,
    pub(crate) owner_pipe: OwnedFd,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Ready(Ready),
    Failed(BootstrapError),
}

struct Lines<'a> {
    reader: BufReader<&'a UnixStream>,
}

impl<'a> Lines<'a> {
    fn new(stream: &'a UnixStream) -> Self {
        Self {
            reader: BufReader::with_capacity(MAX_LINE_SIZE, stream),
        }
    }

    fn next(&mut self, waiting_for: &'static str) -> Result<String> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_SIZE as u64)
            .read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Err(HandshakeError::Eof(waiting_for));
        }
        if buf.pop() != Some(b'\n') {
            return Err(HandshakeError::Violation(if read >= MAX_LINE_SIZE {
                format!("line longer than {} bytes", MAX_LINE_SIZE)
            } else {
                "line without a terminating newline".to_string()
            }));
        }
        String::from_utf8(buf)
            .map_err(|_| HandshakeError::Violation("line is not valid UTF-8".to_string()))
    }

    /// `name: value` lines up to a blank line.
    fn attributes(&mut self, waiting_for: &'static str) -> Result<Vec<(String, String)>> {
        let mut attributes = Vec::new();
        loop {
            let line = self.next(waiting_for)?;
            if line.is_empty() {
                return Ok(attributes);
            }
            let (name, value) = line.split_once(": ").ok_or_else(|| {
                HandshakeError::Violation(format!("expected 'name: value', got {:?}", line))
            })?;
            attributes.push((name.to_string(), value.to_string()));
        }
    }

    /// Fail if the peer sent more than we have consumed so far. Anything
    /// buffered here would be lost to the next reader of the socket.
    fn ensure_drained(&self) -> Result<()> {
        if self.reader.buffer().is_empty() {
            Ok(())
        } else {
            Err(HandshakeError::Violation(
                "unexpected data after the end of a handshake block".to_string(),
            ))
        }
    }

    fn rest(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        (&mut self.reader)
            .take(MAX_DETAILS_SIZE)
            .read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn attribute_line(name: &str, value: &str) -> Result<String> {
    if name.contains('\n') || value.contains('\n') || name.contains(": ") {
        return Err(HandshakeError::Violation(format!(
            "attribute {:?} cannot be sent on one line",
            name
        )));
    }
    Ok(format!("{}: {}\n", name, value))
}

fn send(stream: &UnixStream, text: &str) -> Result<()> {
    channel::send_all(stream, text.as_bytes())?;
    Ok(())
}

/// Spawner side: hand control and options to the worker and read its
/// report. Takes the stream because a successful handshake finishes with a
/// descriptor pass over it.
pub(crate) fn negotiate(stream: UnixStream, options: &SpawnOptions) -> Result<Outcome> {
    send(&stream, &format!("{}\n", CONTROL_REQUEST))?;

    let mut lines = Lines::new(&stream);
    let reply = lines.next("the control acknowledgement")?;
    if reply != CONTROL_REPLY {
        return Err(HandshakeError::Violation(format!(
            "expected {:?}, got {:?}",
            CONTROL_REPLY, reply
        )));
    }

    let mut block = String::new();
    for (name, value) in options.to_pairs() {
        block.push_str(&attribute_line(&name, &value)?);
    }
    block.push('\n');
    send(&stream, &block)?;

    match lines.next("a status line")?.as_str() {
        "Ready" => {
            let mut pid = None;
            let mut sockets = Vec::new();
            for (name, value) in lines.attributes("the ready report")? {
                match name.as_str() {
                    "pid" => {
                        let raw: i32 = value.parse().map_err(|_| {
                            HandshakeError::Violation(format!("invalid pid {:?}", value))
                        })?;
                        pid = Some(Pid::from_raw(raw));
                    }
                    "socket" => sockets.push(ListenEndpoint::parse(&value)?),
                    other => {
                        return Err(HandshakeError::Violation(format!(
                            "unknown ready attribute {:?}",
                            other
                        )));
                    }
                }
            }
            let pid = pid.ok_or_else(|| {
                HandshakeError::Violation("ready report without a pid".to_string())
            })?;
            if sockets.is_empty() {
                return Err(HandshakeError::Violation(
                    "ready report without any socket".to_string(),
                ));
            }
            lines.ensure_drained()?;
            drop(lines);

            let mut channel = Channel::new(stream);
            let owner_pipe = channel.recv_fd_negotiated().map_err(|e| match e {
                Error::Protocol(_) => HandshakeError::Eof("the owner pipe"),
                other => HandshakeError::from(other),
            })?;
            Ok(Outcome::Ready(Ready {
                pid,
                sockets,
                owner_pipe,
            }))
        }
        "Error" => {
            let mut kind = BootstrapKind::General;
            let mut message = String::new();
            for (name, value) in lines.attributes("the error report")? {
                match name.as_str() {
                    "kind" => kind = value.parse().map_err(HandshakeError::Violation)?,
                    "message" => message = value,
                    other => {
                        return Err(HandshakeError::Violation(format!(
                            "unknown error attribute {:?}",
                            other
                        )));
                    }
                }
            }
            let details = lines.rest()?;
            Ok(Outcome::Failed(
                BootstrapError::new(kind, message).with_details(details),
            ))
        }
        other => Err(HandshakeError::Violation(format!(
            "expected 'Ready' or 'Error', got {:?}",
            other
        ))),
    }
}

/// Worker side: take control and read the spawn options.
pub(crate) fn accept(stream: &UnixStream) -> Result<SpawnOptions> {
    let mut lines = Lines::new(stream);
    let request = lines.next("the control request")?;
    if request != CONTROL_REQUEST {
        return Err(HandshakeError::Violation(format!(
            "expected {:?}, got {:?}",
            CONTROL_REQUEST, request
        )));
    }
    send(stream, &format!("{}\n", CONTROL_REPLY))?;

    let pairs = lines.attributes("spawn options")?;
    lines.ensure_drained()?;
    Ok(SpawnOptions::from_pairs(pairs)?)
}

/// Worker side: report a successful load. The owner pipe follows
/// separately over a [`Channel`].
pub(crate) fn report_ready(stream: &UnixStream, pid: Pid, sockets: &[ListenEndpoint]) -> Result<()> {
    let mut block = String::from("Ready\n");
    block.push_str(&attribute_line("pid", &pid.to_string())?);
    for socket in sockets {
        block.push_str(&attribute_line("socket", &socket.to_string())?);
    }
    block.push('\n');
    send(stream, &block)
}

/// Worker side: report a failed load. The caller closes the stream after.
pub(crate) fn report_error(stream: &UnixStream, error: &BootstrapError) -> Result<()> {
    let mut block = String::from("Error\n");
    block.push_str(&attribute_line("kind", error.kind.as_str())?);
    block.push_str(&attribute_line("message", &error.message.replace('\n', " "))?);
    block.push('\n');
    block.push_str(&error.details);
    send(stream, &block)
}
