//! Bridges local endpoints to overlay network connections
//!
//! This crate relays bytes between a locally terminated endpoint (TCP or UDP
//! socket, unix socket, pipe pair, raw descriptors) and a message oriented
//! overlay connection. It provides:
//!
//! - Bidirectional relaying with bounded read buffering and backpressure
//! - Half-close propagation in both directions
//! - Idle timeout teardown
//! - A stream-link adapter that puts an overlay connection at the bottom of a
//!   link chain (HTTP, TLS, ...)
//!
//! # Architecture
//!
//! ```text
//! local endpoint
//!     ↕
//! overlay_bridge (Bridge / OverlayLink)
//!     ↕
//! overlay connection (RemoteConn)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use overlay_bridge::loopback::{Intercept, LoopbackOverlay};
//! use overlay_bridge::{bridge, BridgeOptions, LocalHandle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let overlay = LoopbackOverlay::new();
//!     let mut listener = overlay.register_service("echo", vec![Intercept::tcp("echo.local", 7..=7)]);
//!
//!     // Host the service: bridge every accepted connection to a local server
//!     while let Some(accepted) = listener.accept().await {
//!         let local = tokio::net::TcpStream::connect("127.0.0.1:7007").await?;
//!         let br = bridge(accepted.conn, LocalHandle::Tcp(local), BridgeOptions::default())?;
//!         println!("bridged {}", br.info()?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bridge;
mod deadline;
pub mod error;
pub mod fd_bridge;
pub mod link;
pub mod local;
pub mod loopback;
pub mod overlay;
pub mod pool;
pub mod state;

// Re-export main types
pub use bridge::{bridge, Bridge, BridgeOptions};
pub use error::{Error, Result};
pub use fd_bridge::{bridge_fds, Descriptors};
pub use link::{LinkRead, LinkReader, OverlayLink, PendingConnect, PendingWrite, SourceLink};
pub use local::LocalHandle;
pub use overlay::{
    DataHandler, DialOptions, HostAddr, OverlayContext, Protocol, RemoteConn, RemoteData,
    RemoteError,
};
pub use pool::{BufferPool, FixedPool, PoolStats, PooledBuf, BRIDGE_MSG_SIZE, BRIDGE_POOL_SIZE};
pub use state::{BridgeState, Side};
