//! Framed messaging over a Unix stream socket.
//!
//! Three kinds of payload share one connection, and both peers must issue
//! them in exactly the same order:
//!
//! - **Array messages**: a 2-byte big-endian length, then the elements
//!   each followed by a NUL delimiter. The body is capped at
//!   [`MAX_MESSAGE_SIZE`] bytes.
//! - **Scalars**: a 4-byte big-endian length, then the raw bytes.
//! - **Descriptors**: one file descriptor per call, carried as
//!   `SCM_RIGHTS` ancillary data on a single dummy byte. A message with
//!   more than one descriptor attached is refused.
//!
//! ```text
//! array  ┌────────┬──────┬────┬──────┬────┬───┐
//!        │ len:u16│ elem │ \0 │ elem │ \0 │...│
//!        └────────┴──────┴────┴──────┴────┴───┘
//! scalar ┌────────┬──────────────────┐
//!        │ len:u32│ bytes            │
//!        └────────┴──────────────────┘
//! ```

use std::io::{self, ErrorKind, IoSlice, IoSliceMut};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::{Error, Result};

/// Largest array-message body the 16-bit length prefix can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Separator written after every array-message element.
pub const DELIMITER: u8 = 0;

/// Marker the receiving side sends before a negotiated descriptor pass.
const PASS_IO: &str = "pass IO";
/// Marker the receiving side sends once the descriptor arrived.
const GOT_IO: &str = "got IO";

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Encode an array message into a complete frame (header included).
///
/// Fails before producing anything if an element contains the delimiter or
/// the body would not fit the 16-bit length prefix.
pub fn encode_message<S: AsRef<str>>(elements: &[S]) -> Result<Vec<u8>> {
    let mut size = 0usize;
    for element in elements {
        let element = element.as_ref();
        if element.as_bytes().contains(&DELIMITER) {
            return Err(Error::DelimiterInElement(element.to_string()));
        }
        size += element.len() + 1;
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(2 + size);
    frame.extend_from_slice(&(size as u16).to_be_bytes());
    for element in elements {
        frame.extend_from_slice(element.as_ref().as_bytes());
        frame.push(DELIMITER);
    }
    Ok(frame)
}

/// Decode an array-message body (without its length header).
pub fn decode_message(body: &[u8]) -> Result<Vec<String>> {
    let Some((&last, elements)) = body.split_last() else {
        return Ok(Vec::new());
    };
    if last != DELIMITER {
        return Err(Error::Protocol(
            "array message body lacks its trailing delimiter".to_string(),
        ));
    }
    elements
        .split(|b| *b == DELIMITER)
        .map(|raw| {
            String::from_utf8(raw.to_vec()).map_err(|_| {
                Error::Protocol("array message element is not valid UTF-8".to_string())
            })
        })
        .collect()
}

/// Encode a scalar into a complete frame (header included).
pub fn encode_scalar(data: &[u8]) -> Result<Vec<u8>> {
    let size = u32::try_from(data.len()).map_err(|_| Error::ScalarTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// A framed message channel over one end of a Unix stream socket.
///
/// The channel is unbuffered: every frame is read with exact-length reads so
/// a descriptor pass that follows a message is never consumed early.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// A connected pair of channels, mainly useful for tests.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_inner(self) -> UnixStream {
        self.stream
    }

    /// Write one array message.
    pub fn write<S: AsRef<str>>(&mut self, elements: &[S]) -> Result<()> {
        let frame = encode_message(elements)?;
        self.send_all(&frame)
    }

    /// Read one array message. `None` means the peer closed the connection
    /// cleanly between frames.
    pub fn read(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            match self.read_interruptible() {
                Err(Error::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Like [`read`](Self::read), but a signal that lands before the first
    /// byte of the frame returns an `Interrupted` I/O error. Nothing of the
    /// frame has been consumed in that case, so reading again is safe.
    pub fn read_interruptible(&mut self) -> Result<Option<Vec<String>>> {
        let mut header = [0u8; 2];
        if !self.fill(&mut header, true)? {
            return Ok(None);
        }
        let size = u16::from_be_bytes(header) as usize;
        let mut body = vec![0u8; size];
        self.fill(&mut body, false)?;
        decode_message(&body).map(Some)
    }

    /// Write one scalar.
    pub fn write_scalar(&mut self, data: &[u8]) -> Result<()> {
        let frame = encode_scalar(data)?;
        self.send_all(&frame)
    }

    /// Read one scalar. With `max_size` set, a declared length above it fails
    /// before any of the body is read.
    pub fn read_scalar(&mut self, max_size: Option<usize>) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        let started = loop {
            match self.fill(&mut header, true) {
                Err(Error::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if !started {
            return Ok(None);
        }
        let size = u32::from_be_bytes(header) as usize;
        if let Some(max) = max_size
            && size > max
        {
            return Err(Error::ScalarTooLarge { size, max });
        }
        let mut body = vec![0u8; size];
        self.fill(&mut body, false)?;
        Ok(Some(body))
    }

    /// Pass one descriptor to the peer.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        let payload = [0u8; 1];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        loop {
            match socket::sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive one descriptor from the peer.
    ///
    /// A message carrying more than one descriptor is rejected and every
    /// descriptor in it is closed.
    pub fn recv_fd(&mut self) -> Result<OwnedFd> {
        let mut payload = [0u8; 1];
        let mut control = nix::cmsg_space!([RawFd; 4]);
        let (received, truncated, fds) = loop {
            let mut iov = [IoSliceMut::new(&mut payload)];
            match socket::recvmsg::<()>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut control),
                RECV_FLAGS,
            ) {
                Ok(msg) => {
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs()? {
                        if let ControlMessageOwned::ScmRights(rights) = cmsg {
                            fds.extend(rights);
                        }
                    }
                    break (msg.bytes, msg.flags.contains(MsgFlags::MSG_CTRUNC), fds);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        // SAFETY: the kernel just installed these descriptors in this
        // process and nothing else refers to them.
        let mut fds: Vec<OwnedFd> = fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if truncated {
            return Err(Error::Protocol(
                "file descriptor control message was truncated".to_string(),
            ));
        }
        match (fds.pop(), fds.is_empty()) {
            (Some(fd), true) => Ok(fd),
            (Some(_), false) => Err(Error::Protocol(
                "received more than one file descriptor".to_string(),
            )),
            (None, _) if received == 0 => Err(Error::Protocol(
                "end of stream while waiting for a file descriptor".to_string(),
            )),
            (None, _) => Err(Error::Protocol(
                "expected a file descriptor but received plain data".to_string(),
            )),
        }
    }

    /// Pass a descriptor after the receiver asks for it with `"pass IO"`,
    /// then wait for its `"got IO"` acknowledgement.
    pub fn send_fd_negotiated(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        self.expect_marker(PASS_IO)?;
        self.send_fd(fd)?;
        self.expect_marker(GOT_IO)
    }

    /// Receiving counterpart of [`send_fd_negotiated`](Self::send_fd_negotiated).
    pub fn recv_fd_negotiated(&mut self) -> Result<OwnedFd> {
        self.write(&[PASS_IO])?;
        let fd = self.recv_fd()?;
        self.write(&[GOT_IO])?;
        Ok(fd)
    }

    fn expect_marker(&mut self, marker: &str) -> Result<()> {
        match self.read()? {
            Some(message) if message.len() == 1 && message[0] == marker => Ok(()),
            Some(other) => Err(Error::Protocol(format!(
                "expected {:?} during descriptor passing, got {:?}",
                marker, other
            ))),
            None => Err(Error::Protocol(format!(
                "end of stream while waiting for {:?}",
                marker
            ))),
        }
    }

    /// Fill `buf` completely.
    ///
    /// Returns `Ok(false)` if `frame_start` is set and the peer closed (or
    /// reset) the connection before the first byte. A signal that lands
    /// before the first byte of a frame surfaces as `Interrupted`; once a
    /// frame has started, interrupted reads are retried.
    fn fill(&mut self, buf: &mut [u8], frame_start: bool) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let untouched = frame_start && filled == 0;
            match nix::unistd::read(&self.stream, &mut buf[filled..]) {
                Ok(0) if untouched => return Ok(false),
                Ok(0) => {
                    return Err(Error::Protocol(
                        "end of stream in the middle of a frame".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(Errno::EINTR) if untouched => {
                    return Err(io::Error::from(ErrorKind::Interrupted).into());
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) if untouched => return Ok(false),
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32).into()),
            }
        }
        Ok(true)
    }

    fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        send_all(&self.stream, buf)
    }
}

/// Write all of `buf` to `socket` without raising SIGPIPE.
pub(crate) fn send_all(socket: &UnixStream, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match socket::send(socket.as_raw_fd(), buf, SEND_FLAGS) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
