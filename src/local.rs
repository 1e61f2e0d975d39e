//! Local endpoints a bridge can be attached to.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsFd;
use std::sync::Mutex;

use socket2::SockRef;
use tokio::net::unix::pipe;
use tokio::net::{TcpStream, UdpSocket, UnixStream};

use crate::error::{Error, Result};

/// A locally terminated endpoint.
#[derive(Debug)]
pub enum LocalHandle {
    Tcp(TcpStream),
    /// Must be connected to a peer.
    Udp(UdpSocket),
    Unix(UnixStream),
    /// Separate read and write descriptors.
    Pipes {
        input: pipe::Receiver,
        output: pipe::Sender,
    },
}

impl LocalHandle {
    pub fn is_connectionless(&self) -> bool {
        matches!(self, LocalHandle::Udp(_))
    }
}

/// Runs a closure when dropped; used to report that every local handle of a
/// bridge has been closed.
pub(crate) struct CloseNotify(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl CloseNotify {
    pub(crate) fn new(f: Box<dyn FnOnce() + Send>) -> Self {
        Self(Mutex::new(Some(f)))
    }
}

impl Drop for CloseNotify {
    fn drop(&mut self) {
        let f = match self.0.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(f) = f {
            f();
        }
    }
}

enum LocalIo {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
    Pipes {
        input: pipe::Receiver,
        output: Mutex<Option<pipe::Sender>>,
    },
}

/// Shared by the bridge session and its read task. The descriptors close when
/// the last reference goes away; `on_close` runs after that.
pub(crate) struct LocalEndpoint {
    io: LocalIo,
    // declared last: dropped after the descriptors above
    _on_close: Option<CloseNotify>,
}

impl LocalEndpoint {
    pub(crate) fn new(handle: LocalHandle, on_close: Option<CloseNotify>) -> Self {
        let io = match handle {
            LocalHandle::Tcp(s) => LocalIo::Tcp(s),
            LocalHandle::Udp(s) => LocalIo::Udp(s),
            LocalHandle::Unix(s) => LocalIo::Unix(s),
            LocalHandle::Pipes { input, output } => LocalIo::Pipes {
                input,
                output: Mutex::new(Some(output)),
            },
        };
        Self {
            io,
            _on_close: on_close,
        }
    }

    pub(crate) fn is_connectionless(&self) -> bool {
        matches!(self.io, LocalIo::Udp(_))
    }

    /// Wait for and read one chunk. `Ok(0)` means EOF on stream endpoints; on a
    /// datagram endpoint it is an empty datagram.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.io {
            LocalIo::Udp(s) => s.recv(buf).await,
            LocalIo::Tcp(s) => loop {
                s.readable().await?;
                match s.try_read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    res => return res,
                }
            },
            LocalIo::Unix(s) => loop {
                s.readable().await?;
                match s.try_read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    res => return res,
                }
            },
            LocalIo::Pipes { input, .. } => loop {
                input.readable().await?;
                match input.try_read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    res => return res,
                }
            },
        }
    }

    /// Non-blocking write. Fails with `WouldBlock` when the endpoint cannot
    /// take any data right now.
    ///
    /// Writes go straight to the descriptor (already `O_NONBLOCK`) instead of
    /// through the reactor's readiness cache, which reports `WouldBlock` until
    /// a writable event has been observed.
    pub(crate) fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        match &self.io {
            LocalIo::Tcp(s) => SockRef::from(s).send(data),
            LocalIo::Udp(s) => SockRef::from(s).send(data),
            LocalIo::Unix(s) => SockRef::from(s).send(data),
            LocalIo::Pipes { output, .. } => {
                let guard = output
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))?;
                match guard.as_ref() {
                    Some(tx) => Ok(rustix::io::write(tx.as_fd(), data)?),
                    None => Err(io::ErrorKind::BrokenPipe.into()),
                }
            }
        }
    }

    /// Shut down the write side so the local peer sees EOF.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        match &self.io {
            LocalIo::Tcp(s) => SockRef::from(s).shutdown(Shutdown::Write),
            LocalIo::Unix(s) => SockRef::from(s).shutdown(Shutdown::Write),
            LocalIo::Udp(_) => Ok(()),
            LocalIo::Pipes { output, .. } => {
                let sender = output
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "output lock poisoned"))?
                    .take();
                match sender {
                    Some(tx) => {
                        drop(tx);
                        Ok(())
                    }
                    None => Err(io::ErrorKind::NotConnected.into()),
                }
            }
        }
    }

    /// `"proto: local:port -> remote:port"` for sockets, `"pipe: -> name"` for
    /// unix sockets bound to a path.
    pub(crate) fn info(&self) -> Result<String> {
        match &self.io {
            LocalIo::Tcp(s) => Ok(format_link(
                "tcp",
                s.local_addr().ok(),
                s.peer_addr().ok(),
            )),
            LocalIo::Udp(s) => Ok(format_link(
                "udp",
                s.local_addr().ok(),
                s.peer_addr().ok(),
            )),
            LocalIo::Unix(s) => {
                let peer = s.peer_addr().map_err(|_| Error::InvalidState)?;
                match peer.as_pathname() {
                    Some(path) => Ok(format!("pipe: -> {}", path.display())),
                    None => Err(Error::InvalidState),
                }
            }
            LocalIo::Pipes { .. } => Err(Error::InvalidState),
        }
    }
}

fn format_link(proto: &str, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> String {
    format!("{}: {} -> {}", proto, format_addr(local), format_addr(remote))
}

fn format_addr(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(a) => format!("{}:{}", a.ip(), a.port()),
        None => "unknown:-1".to_string(),
    }
}
