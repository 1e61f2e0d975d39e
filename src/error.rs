use std::io;

use crate::overlay::RemoteError;

/// Errors surfaced by bridge setup, bridge queries and the stream link.
///
/// Transport failures that happen after a session is running are never
/// returned to the embedder; they tear the session down instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Overlay connection error
    #[error("overlay error: {0}")]
    Remote(#[from] RemoteError),

    /// Unsupported handle, unconnected datagram socket, malformed argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The overlay connection refused the data handler
    #[error("connection reset")]
    ConnectionReset,

    /// Reading from the local endpoint could not be started
    #[error("connection aborted")]
    ConnectionAborted,

    /// Operation not valid in the current state (e.g. bridge already closed)
    #[error("invalid state")]
    InvalidState,

    /// No overlay service intercepts the requested address
    #[error("no service for address[{0}]")]
    ServiceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
