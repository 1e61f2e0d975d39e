//! Bridging from raw file descriptors.
//!
//! A single descriptor is inspected and wrapped as the matching socket type.
//! Two distinct descriptors are treated as a read-only input and a write-only
//! output (stdin/stdout, a pair of pipes, a tty).

use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use socket2::{Socket, Type};
use tokio::net::unix::pipe;
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tracing::{debug, error};

use crate::bridge::{attach, Bridge, BridgeOptions};
use crate::error::{Error, Result};
use crate::local::{CloseNotify, LocalEndpoint, LocalHandle};
use crate::overlay::RemoteConn;

/// Descriptors to bridge. The bridge takes ownership and closes them on
/// teardown.
#[derive(Debug)]
pub enum Descriptors {
    /// One socket used for both directions.
    Duplex(OwnedFd),
    /// Read from `input`, write to `output`.
    Split { input: OwnedFd, output: OwnedFd },
}

impl Descriptors {
    /// Take ownership of raw descriptors. Equal descriptors make a
    /// [`Descriptors::Duplex`].
    ///
    /// # Safety
    ///
    /// Both descriptors must be open and exclusively owned by the caller.
    pub unsafe fn from_raw(input: RawFd, output: RawFd) -> Self {
        if input == output {
            Descriptors::Duplex(OwnedFd::from_raw_fd(input))
        } else {
            Descriptors::Split {
                input: OwnedFd::from_raw_fd(input),
                output: OwnedFd::from_raw_fd(output),
            }
        }
    }
}

/// Bridge a remote connection to descriptors.
///
/// `on_close` runs exactly once, after every descriptor has been closed. That
/// includes the case where setup fails after the descriptors were taken.
pub fn bridge_fds(
    conn: Arc<dyn RemoteConn>,
    fds: Descriptors,
    on_close: Option<Box<dyn FnOnce() + Send>>,
    opts: BridgeOptions,
) -> Result<Bridge> {
    let notify = on_close.map(CloseNotify::new);
    if tokio::runtime::Handle::try_current().is_err() {
        drop(fds);
        drop(notify);
        return Err(Error::InvalidState);
    }

    let handle = match fds {
        Descriptors::Duplex(fd) => duplex_handle(fd)?,
        Descriptors::Split { input, output } => split_handle(input, output).map_err(|e| {
            error!("br[{}] failed to open descriptors: {}", conn.conn_id(), e);
            Error::ConnectionAborted
        })?,
    };
    debug!("br[{}] bridging {:?}", conn.conn_id(), handle);

    attach(conn, LocalEndpoint::new(handle, notify), opts)
}

fn duplex_handle(fd: OwnedFd) -> Result<LocalHandle> {
    let sock = Socket::from(fd);
    let ty = sock.r#type().map_err(|e| {
        error!("unsupported fd type: {}", e);
        Error::InvalidArgument("descriptor is not a socket".into())
    })?;
    sock.set_nonblocking(true)?;

    if ty == Type::STREAM {
        let inet = sock
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .is_some();
        if inet {
            let std_stream: std::net::TcpStream = sock.into();
            Ok(LocalHandle::Tcp(TcpStream::from_std(std_stream)?))
        } else {
            let std_stream: std::os::unix::net::UnixStream = sock.into();
            Ok(LocalHandle::Unix(UnixStream::from_std(std_stream)?))
        }
    } else if ty == Type::DGRAM {
        let std_sock: std::net::UdpSocket = sock.into();
        if let Err(e) = std_sock.peer_addr() {
            error!("cannot bridge unconnected socket: {}", e);
            return Err(Error::InvalidArgument("datagram socket is not connected".into()));
        }
        Ok(LocalHandle::Udp(UdpSocket::from_std(std_sock)?))
    } else {
        error!("unsupported fd type: {:?}", ty);
        Err(Error::InvalidArgument(format!("unsupported socket type {:?}", ty)))
    }
}

fn split_handle(input: OwnedFd, output: OwnedFd) -> io::Result<LocalHandle> {
    rustix::io::ioctl_fionbio(input.as_fd(), true)?;
    rustix::io::ioctl_fionbio(output.as_fd(), true)?;
    Ok(LocalHandle::Pipes {
        input: pipe::Receiver::from_owned_fd_unchecked(input)?,
        output: pipe::Sender::from_owned_fd_unchecked(output)?,
    })
}
