//! Overlay connection as the source hop of a stream-link chain.
//!
//! A link consumer (an HTTP or TLS client, for instance) drives the link with
//! connect/write/close and receives data by first offering a buffer through
//! [`LinkReader::alloc`] and then getting it back filled in
//! [`LinkReader::on_read`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use crate::error::{Error, Result};
use crate::overlay::{
    DataHandler, DialOptions, HostAddr, OverlayContext, Protocol, RemoteConn, RemoteData,
    RemoteError,
};

/// Buffer size offered to [`LinkReader::alloc`] for each delivery.
pub const LINK_READ_SIZE: usize = 64 * 1024;

/// One delivery to the link consumer.
#[derive(Debug)]
pub enum LinkRead {
    Data(BytesMut),
    Eof,
    Error(io::Error),
}

/// Consumer side of a link.
pub trait LinkReader: Send {
    /// Offer a buffer for the next delivery. The buffer's length is the space
    /// offered; an empty buffer means the consumer cannot take data now.
    fn alloc(&mut self, suggested: usize) -> BytesMut;

    /// Receive data (truncated to the bytes copied), EOF or an error.
    fn on_read(&mut self, read: LinkRead);

    /// The link finished closing.
    fn on_close(&mut self) {}
}

/// Generic operations of the source hop in a link chain.
pub trait SourceLink {
    /// Start connecting to `host:port`. The returned future resolves with the
    /// establishment status.
    fn connect(&mut self, host: &str, port: &str) -> Result<PendingConnect>;

    /// Reading is push driven, so this does nothing.
    fn read_start(&mut self) -> Result<()>;

    /// Write the first buffer of `bufs`. Callers pass one buffer per write;
    /// any others are ignored.
    fn write(&mut self, bufs: &[Bytes]) -> Result<PendingWrite>;

    /// Close the connection and report completion to the reader right away.
    fn close(&mut self);

    /// Text for a status code.
    fn strerror(&self, code: i32) -> &'static str;
}

/// Resolves once the overlay connection is established or has failed.
#[derive(Debug)]
pub struct PendingConnect {
    rx: oneshot::Receiver<std::result::Result<(), RemoteError>>,
}

impl Future for PendingConnect {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Remote(e)),
            Err(_) => Err(Error::Remote(RemoteError::ConnClosed)),
        })
    }
}

/// Resolves with the number of bytes written.
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<std::result::Result<usize, RemoteError>>,
}

impl Future for PendingWrite {
    type Output = io::Result<usize>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(status) => status.map_err(io::Error::from),
            Err(_) => Err(RemoteError::ConnClosed.into()),
        })
    }
}

#[derive(Serialize)]
struct DialMetadata<'a> {
    dst_protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dst_ip: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dst_hostname: Option<&'a str>,
    dst_port: &'a str,
}

type SharedReader = Arc<Mutex<Option<Box<dyn LinkReader>>>>;

/// Pushes remote data into the link reader.
struct LinkHandler {
    service: String,
    reader: SharedReader,
}

impl DataHandler for LinkHandler {
    fn on_data(&self, data: RemoteData<'_>) -> usize {
        let Ok(mut slot) = self.reader.lock() else {
            return 0;
        };
        let Some(reader) = slot.as_mut() else {
            return 0;
        };

        match data {
            RemoteData::Eof => {
                trace!("{} EOF", self.service);
                reader.on_read(LinkRead::Eof);
                0
            }
            RemoteData::Closed => {
                reader.on_read(LinkRead::Error(RemoteError::ConnClosed.into()));
                0
            }
            RemoteData::Error(e) => {
                error!("unexpected error: {}", e);
                reader.on_read(LinkRead::Error(e.into()));
                0
            }
            RemoteData::Bytes(chunk) => {
                trace!("propagating read {} bytes", chunk.len());
                let mut buf = reader.alloc(LINK_READ_SIZE);
                if buf.is_empty() {
                    return 0;
                }
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                buf.truncate(n);
                reader.on_read(LinkRead::Data(buf));
                n
            }
        }
    }
}

/// Stream-link source backed by an overlay connection.
///
/// The service is either fixed at construction or looked up from the
/// intercepts when connecting. Dropping the link closes its connection.
pub struct OverlayLink {
    ctx: Arc<dyn OverlayContext>,
    service: Option<String>,
    conn: Option<Arc<dyn RemoteConn>>,
    reader: SharedReader,
}

impl OverlayLink {
    pub fn new(ctx: Arc<dyn OverlayContext>, service: Option<&str>) -> Self {
        Self {
            ctx,
            service: service.map(str::to_string),
            conn: None,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    /// Install the consumer that receives data and close notifications.
    pub fn set_reader(&mut self, reader: Box<dyn LinkReader>) {
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn resolve_service(&mut self, addr: &HostAddr, host: &str, port: &str) -> Result<String> {
        if let Some(service) = &self.service {
            return Ok(service.clone());
        }
        let found = port
            .parse::<u16>()
            .ok()
            .and_then(|p| self.ctx.service_for_addr(Protocol::Tcp, addr, p));
        match found {
            Some(service) => {
                self.service = Some(service.clone());
                Ok(service)
            }
            None => {
                error!("no service for address[tcp:{}:{}]", host, port);
                Err(Error::ServiceUnavailable(format!("tcp:{}:{}", host, port)))
            }
        }
    }
}

impl SourceLink for OverlayLink {
    fn connect(&mut self, host: &str, port: &str) -> Result<PendingConnect> {
        if self.conn.is_some() {
            return Err(Error::InvalidState);
        }
        let addr = HostAddr::parse(host);
        let service = self.resolve_service(&addr, host, port)?;
        trace!("service {}", service);

        let (dst_ip, dst_hostname) = match addr {
            HostAddr::Ip(_) => (Some(host), None),
            HostAddr::Hostname(_) => (None, Some(host)),
        };
        let app_data = serde_json::to_vec(&DialMetadata {
            dst_protocol: "tcp",
            dst_ip,
            dst_hostname,
            dst_port: port,
        })
        .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let handler = Arc::new(LinkHandler {
            service: service.clone(),
            reader: self.reader.clone(),
        });
        let (tx, rx) = oneshot::channel();
        let conn = self.ctx.dial(
            &service,
            DialOptions { app_data },
            handler,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        )?;
        self.conn = Some(conn);
        Ok(PendingConnect { rx })
    }

    fn read_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, bufs: &[Bytes]) -> Result<PendingWrite> {
        let Some(first) = bufs.first() else {
            return Err(Error::InvalidArgument("no buffers to write".into()));
        };
        let Some(conn) = &self.conn else {
            return Err(Error::InvalidState);
        };
        trace!(
            "{}, nbuf={}, buf[0].len={}",
            self.service.as_deref().unwrap_or_default(),
            bufs.len(),
            first.len()
        );

        let (tx, rx) = oneshot::channel();
        conn.write(
            Box::new(first.clone()),
            Box::new(move |status, _| {
                let _ = tx.send(status);
            }),
        )?;
        Ok(PendingWrite { rx })
    }

    fn close(&mut self) {
        trace!("{}", self.service.as_deref().unwrap_or_default());
        if let Some(conn) = self.conn.take() {
            conn.close(None);
        }
        match self.reader.lock() {
            Ok(mut slot) => {
                if let Some(reader) = slot.as_mut() {
                    reader.on_close();
                }
            }
            Err(_) => warn!("link reader lock poisoned"),
        }
    }

    fn strerror(&self, code: i32) -> &'static str {
        RemoteError::describe(code)
    }
}

impl Drop for OverlayLink {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close(None);
        }
    }
}
