//! The overlay connection abstraction.
//!
//! A remote connection is message oriented and push based: once a
//! [`DataHandler`] is installed the connection calls it for every chunk it
//! receives, and the handler answers with the number of bytes it consumed.
//! Anything left unconsumed is the connection's to re-deliver later.
//!
//! Writes, half-closes and closes are submitted without blocking. Their
//! outcome arrives later through a one-shot continuation that carries a typed
//! result instead of an opaque context pointer.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// Overlay status codes.
///
/// The numeric values are stable and match the overlay's wire/status domain,
/// so [`RemoteError::describe`] can render codes coming from foreign layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("service not available")]
    ServiceUnavailable,
    #[error("operation did not complete in time")]
    Timeout,
    #[error("connection to edge router terminated")]
    ConnAborted,
    #[error("invalid state")]
    InvalidState,
    #[error("connection is closed")]
    ConnClosed,
    #[error("not authorized")]
    NotAuthorized,
    #[error("memory allocation failed")]
    AllocFailed,
    #[error("unexpected error ({0})")]
    Other(i32),
}

const OK: i32 = 0;
const SERVICE_UNAVAILABLE: i32 = -18;
const EOF: i32 = -19;
const TIMEOUT: i32 = -20;
const CONN_ABORT: i32 = -21;
const INVALID_STATE: i32 = -22;
const CONN_CLOSED: i32 = -24;
const NOT_AUTHORIZED: i32 = -15;
const ALLOC_FAILED: i32 = -38;

impl RemoteError {
    pub fn code(&self) -> i32 {
        match self {
            RemoteError::ServiceUnavailable => SERVICE_UNAVAILABLE,
            RemoteError::Timeout => TIMEOUT,
            RemoteError::ConnAborted => CONN_ABORT,
            RemoteError::InvalidState => INVALID_STATE,
            RemoteError::ConnClosed => CONN_CLOSED,
            RemoteError::NotAuthorized => NOT_AUTHORIZED,
            RemoteError::AllocFailed => ALLOC_FAILED,
            RemoteError::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            SERVICE_UNAVAILABLE => RemoteError::ServiceUnavailable,
            TIMEOUT => RemoteError::Timeout,
            CONN_ABORT => RemoteError::ConnAborted,
            INVALID_STATE => RemoteError::InvalidState,
            CONN_CLOSED => RemoteError::ConnClosed,
            NOT_AUTHORIZED => RemoteError::NotAuthorized,
            ALLOC_FAILED => RemoteError::AllocFailed,
            other => RemoteError::Other(other),
        }
    }

    /// Human-readable text for a raw overlay status code.
    pub fn describe(code: i32) -> &'static str {
        match code {
            OK => "OK",
            EOF => "end of data",
            SERVICE_UNAVAILABLE => "service not available",
            TIMEOUT => "operation did not complete in time",
            CONN_ABORT => "connection to edge router terminated",
            INVALID_STATE => "invalid state",
            CONN_CLOSED => "connection is closed",
            NOT_AUTHORIZED => "not authorized",
            ALLOC_FAILED => "memory allocation failed",
            _ => "unexpected error",
        }
    }
}

impl From<RemoteError> for io::Error {
    fn from(err: RemoteError) -> Self {
        let kind = match err {
            RemoteError::ServiceUnavailable => io::ErrorKind::NotFound,
            RemoteError::Timeout => io::ErrorKind::TimedOut,
            RemoteError::ConnAborted => io::ErrorKind::ConnectionAborted,
            RemoteError::InvalidState => io::ErrorKind::NotConnected,
            RemoteError::ConnClosed => io::ErrorKind::BrokenPipe,
            RemoteError::NotAuthorized => io::ErrorKind::PermissionDenied,
            RemoteError::AllocFailed => io::ErrorKind::OutOfMemory,
            RemoteError::Other(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// One push from a remote connection.
#[derive(Debug)]
pub enum RemoteData<'a> {
    /// A chunk of payload. Never empty.
    Bytes(&'a [u8]),
    /// The peer will send nothing more.
    Eof,
    /// The connection was closed normally.
    Closed,
    /// The connection failed.
    Error(RemoteError),
}

/// Receiver of pushed data.
///
/// The return value is the number of bytes consumed from a
/// [`RemoteData::Bytes`] chunk; it must never exceed the chunk length.
/// Non-data pushes return 0.
pub trait DataHandler: Send + Sync {
    fn on_data(&self, data: RemoteData<'_>) -> usize;
}

/// Payload of a remote write. Ownership travels with the write and comes
/// back in its completion, so the caller can recycle it.
pub type WriteBuf = Box<dyn AsRef<[u8]> + Send>;

/// Completion of a remote write: the number of bytes written or the failure,
/// plus the payload that was written.
pub type WriteCallback = Box<dyn FnOnce(Result<usize, RemoteError>, WriteBuf) + Send>;

/// Completion of a remote close.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Completion of a dial.
pub type ConnectCallback = Box<dyn FnOnce(Result<(), RemoteError>) + Send>;

/// An established (or establishing) overlay connection.
///
/// Callbacks are never invoked from inside the method that submitted them.
pub trait RemoteConn: Send + Sync + 'static {
    /// Connection id, used for log prefixes.
    fn conn_id(&self) -> u32;

    /// Install the push-data handler. Fails if the connection can no longer
    /// deliver data.
    fn set_data_handler(&self, handler: Arc<dyn DataHandler>) -> Result<(), RemoteError>;

    /// Submit `data` for transmission. On `Ok` the callback runs exactly once;
    /// on `Err` both the payload and the callback are dropped.
    fn write(&self, data: WriteBuf, done: WriteCallback) -> Result<(), RemoteError>;

    /// Half-close: no more data will be written.
    fn close_write(&self) -> Result<(), RemoteError>;

    /// Close the connection. The data handler is released before `done` runs.
    fn close(&self, done: Option<CloseCallback>);
}

/// Transport protocol named in intercept lookups and dial metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// A destination address as written by the caller: an IP or a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostAddr {
    Ip(IpAddr),
    Hostname(String),
}

impl HostAddr {
    pub fn parse(host: &str) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => HostAddr::Ip(ip),
            Err(_) => HostAddr::Hostname(host.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::Ip(ip) => write!(f, "{}", ip),
            HostAddr::Hostname(name) => f.write_str(name),
        }
    }
}

/// Options attached to a dial.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Opaque application data delivered to the hosting side.
    pub app_data: Vec<u8>,
}

/// The overlay network as seen by a dialing client.
pub trait OverlayContext: Send + Sync + 'static {
    /// Find the service intercepting `protocol:addr:port`.
    fn service_for_addr(&self, protocol: Protocol, addr: &HostAddr, port: u16) -> Option<String>;

    /// Start connecting to `service`. Data is pushed to `handler`; `done`
    /// runs once with the establishment result.
    fn dial(
        &self,
        service: &str,
        opts: DialOptions,
        handler: Arc<dyn DataHandler>,
        done: ConnectCallback,
    ) -> Result<Arc<dyn RemoteConn>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip_known_values() {
        for err in [
            RemoteError::ServiceUnavailable,
            RemoteError::Timeout,
            RemoteError::ConnAborted,
            RemoteError::InvalidState,
            RemoteError::ConnClosed,
        ] {
            assert_eq!(RemoteError::from_code(err.code()), err);
        }
        assert_eq!(RemoteError::from_code(-111), RemoteError::Other(-111));
    }

    #[test]
    fn test_describe() {
        assert_eq!(RemoteError::describe(0), "OK");
        assert_eq!(RemoteError::describe(-19), "end of data");
        assert_eq!(RemoteError::describe(-18), "service not available");
        assert_eq!(RemoteError::describe(12345), "unexpected error");
    }

    #[test]
    fn test_io_error_translation() {
        let err: io::Error = RemoteError::ConnClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err: io::Error = RemoteError::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_host_addr_parse() {
        assert_eq!(
            HostAddr::parse("10.1.2.3"),
            HostAddr::Ip("10.1.2.3".parse().unwrap())
        );
        assert_eq!(
            HostAddr::parse("[::1]"),
            HostAddr::Ip("::1".parse().unwrap())
        );
        assert_eq!(
            HostAddr::parse("Wttr.IN"),
            HostAddr::Hostname("wttr.in".to_string())
        );
    }
}
