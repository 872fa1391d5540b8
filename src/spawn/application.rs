//! Descriptor of a spawned worker process.

use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::channel::Channel;
use crate::error::{Error, Result};

/// One address a worker accepts connections on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
    pub name: String,
    /// `unix:/path`, `unix:@abstract-name` or `tcp://host:port`.
    pub address: String,
    pub protocol: String,
    pub concurrency: u32,
}

impl ListenEndpoint {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        protocol: impl Into<String>,
        concurrency: u32,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            protocol: protocol.into(),
            concurrency,
        }
    }

    /// A Unix socket endpoint at `path`.
    pub fn unix(name: impl Into<String>, path: &Path, protocol: impl Into<String>) -> Self {
        Self::new(name, format!("unix:{}", path.display()), protocol, 1)
    }

    /// Path (or `@name`) of a Unix socket endpoint.
    pub fn socket_name(&self) -> Option<&str> {
        self.address.strip_prefix("unix:")
    }

    /// Whether the endpoint lives in the Linux abstract socket namespace.
    pub fn is_abstract_namespace(&self) -> bool {
        self.socket_name().is_some_and(|name| name.starts_with('@'))
    }

    /// Parse the `name;address;protocol;concurrency` form.
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split(';').collect();
        let [name, address, protocol, concurrency] = fields.as_slice() else {
            return Err(Error::Protocol(format!(
                "socket description needs 4 ';'-separated fields: {:?}",
                value
            )));
        };
        if name.is_empty() || address.is_empty() {
            return Err(Error::Protocol(format!(
                "socket description has an empty name or address: {:?}",
                value
            )));
        }
        let concurrency = concurrency.parse().map_err(|_| {
            Error::Protocol(format!("invalid socket concurrency {:?}", concurrency))
        })?;
        Ok(Self::new(*name, *address, *protocol, concurrency))
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.name, self.address, self.protocol, self.concurrency
        )
    }
}

/// A spawned worker as seen by whoever asked for it.
///
/// Holding an `Application` keeps a reference on the worker's owner pipe.
/// Closing it (or dropping it) only gives up that reference; the worker
/// decides on its own when to exit once all references are gone.
#[derive(Debug)]
pub struct Application {
    app_root: PathBuf,
    pid: Pid,
    sockets: Vec<ListenEndpoint>,
    owner_pipe: Option<OwnedFd>,
}

impl Application {
    pub(crate) fn new(
        app_root: PathBuf,
        pid: Pid,
        sockets: Vec<ListenEndpoint>,
        owner_pipe: OwnedFd,
    ) -> Result<Self> {
        if sockets.is_empty() {
            return Err(Error::Protocol(
                "worker reported no listen sockets".to_string(),
            ));
        }
        Ok(Self {
            app_root,
            pid,
            sockets,
            owner_pipe: Some(owner_pipe),
        })
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The main endpoint.
    pub fn listen_endpoint(&self) -> &ListenEndpoint {
        &self.sockets[0]
    }

    pub fn sockets(&self) -> &[ListenEndpoint] {
        &self.sockets
    }

    pub fn owner_pipe(&self) -> Option<BorrowedFd<'_>> {
        self.owner_pipe.as_ref().map(|fd| fd.as_fd())
    }

    /// Take the owner pipe out, e.g. to hand it to another process.
    pub fn take_owner_pipe(&mut self) -> Option<OwnedFd> {
        self.owner_pipe.take()
    }

    /// Release this reference to the worker. Safe to call more than once.
    pub fn close(&mut self) {
        self.owner_pipe = None;
    }

    pub fn is_closed(&self) -> bool {
        self.owner_pipe.is_none()
    }

    /// Send as `["app", root, pid, socket...]` followed by a negotiated
    /// pass of the owner pipe.
    pub(crate) fn write_to_channel(&self, channel: &mut Channel) -> Result<()> {
        let owner_pipe = self.owner_pipe.as_ref().ok_or_else(|| {
            Error::Protocol("cannot forward an application that was closed".to_string())
        })?;
        let mut message = vec![
            "app".to_string(),
            self.app_root.display().to_string(),
            self.pid.to_string(),
        ];
        message.extend(self.sockets.iter().map(ToString::to_string));
        channel.write(&message)?;
        channel.send_fd_negotiated(owner_pipe.as_fd())
    }

    /// Counterpart of [`write_to_channel`](Self::write_to_channel).
    pub(crate) fn read_from_channel(channel: &mut Channel) -> Result<Self> {
        let message = channel.read()?.ok_or_else(|| {
            Error::Protocol("end of stream while waiting for an application".to_string())
        })?;
        let [tag, app_root, pid, sockets @ ..] = message.as_slice() else {
            return Err(Error::Protocol(format!(
                "malformed application message: {:?}",
                message
            )));
        };
        if tag != "app" {
            return Err(Error::Protocol(format!(
                "expected an application message, got {:?}",
                tag
            )));
        }
        let pid: i32 = pid
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid application pid {:?}", pid)))?;
        let sockets = sockets
            .iter()
            .map(|s| ListenEndpoint::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let owner_pipe = channel.recv_fd_negotiated()?;
        Self::new(PathBuf::from(app_root), Pid::from_raw(pid), sockets, owner_pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use std::thread;

    #[test]
    fn test_endpoint_parse_and_display() {
        let endpoint = ListenEndpoint::parse("main;unix:/tmp/app.sock;http;4").unwrap();
        assert_eq!(endpoint.name, "main");
        assert_eq!(endpoint.socket_name(), Some("/tmp/app.sock"));
        assert_eq!(endpoint.concurrency, 4);
        assert!(!endpoint.is_abstract_namespace());
        assert_eq!(endpoint.to_string(), "main;unix:/tmp/app.sock;http;4");

        let tcp = ListenEndpoint::parse("main;tcp://127.0.0.1:3000;http;0").unwrap();
        assert_eq!(tcp.socket_name(), None);
    }

    #[test]
    fn test_abstract_namespace_flag() {
        let endpoint = ListenEndpoint::new("main", "unix:@warmspawn-1234", "session", 1);
        assert!(endpoint.is_abstract_namespace());
    }

    #[test]
    fn test_endpoint_parse_rejects_malformed() {
        assert!(ListenEndpoint::parse("main;unix:/tmp/a.sock;http").is_err());
        assert!(ListenEndpoint::parse("main;unix:/tmp/a.sock;http;many").is_err());
        assert!(ListenEndpoint::parse(";unix:/tmp/a.sock;http;1").is_err());
    }

    #[test]
    fn test_application_crosses_a_channel() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let (reader, writer) = nix::unistd::pipe().unwrap();
        let app = Application::new(
            PathBuf::from("/srv/app"),
            Pid::from_raw(4242),
            vec![
                ListenEndpoint::new("main", "unix:/tmp/main.sock", "session", 1),
                ListenEndpoint::new("http", "tcp://127.0.0.1:3000", "http", 8),
            ],
            writer,
        )
        .unwrap();

        let sender = thread::spawn(move || {
            let mut app = app;
            app.write_to_channel(&mut a).unwrap();
            app.close();
            app.close();
            assert!(app.is_closed());
        });

        let mut received = Application::read_from_channel(&mut b).unwrap();
        sender.join().unwrap();

        assert_eq!(received.app_root(), Path::new("/srv/app"));
        assert_eq!(received.pid(), Pid::from_raw(4242));
        assert_eq!(received.sockets().len(), 2);
        assert_eq!(received.listen_endpoint().name, "main");

        // The reader sees EOF only after the last copy of the write end goes.
        received.close();
        let mut rest = Vec::new();
        File::from(reader).read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_application_requires_a_socket() {
        let (_reader, writer) = nix::unistd::pipe().unwrap();
        let result = Application::new(PathBuf::from("/srv/app"), Pid::from_raw(1), vec![], writer);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
