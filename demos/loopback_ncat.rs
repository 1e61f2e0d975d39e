//! ncat-style relay through the in-memory overlay
//!
//! Hosts a service that bridges every dialed connection to a TCP target, then
//! dials it and bridges stdin/stdout to the connection.
//!
//! Usage: loopback_ncat --target 127.0.0.1:8080 [--idle 30]

use std::io::{stdin, stdout};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{error, info};

use overlay_bridge::loopback::LoopbackOverlay;
use overlay_bridge::{
    bridge, bridge_fds, BridgeOptions, DataHandler, Descriptors, DialOptions, LocalHandle,
    OverlayContext, RemoteConn, RemoteData,
};

const SERVICE: &str = "ncat";

/// Holds pushes back until the bridge takes over the connection.
struct Parked;

impl DataHandler for Parked {
    fn on_data(&self, _data: RemoteData<'_>) -> usize {
        0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("info,overlay_bridge=debug")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let target = get_arg(&args, "--target")?;
    let idle = get_arg(&args, "--idle")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);

    let overlay = LoopbackOverlay::new();
    let mut listener = overlay.register_service(SERVICE, Vec::new());

    // Hosting side: bridge each dialed connection to the target
    tokio::spawn(async move {
        while let Some(accepted) = listener.accept().await {
            let local = match TcpStream::connect(&target).await {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to connect to {}: {}", target, e);
                    accepted.conn.close(None);
                    continue;
                }
            };
            match bridge(accepted.conn, LocalHandle::Tcp(local), BridgeOptions::default()) {
                Ok(br) => info!("Hosting {}", br.info().unwrap_or_default()),
                Err(e) => error!("Failed to bridge: {}", e),
            }
        }
    });

    // Dialing side: stdin/stdout on top of the overlay connection
    let conn = overlay.dial(
        SERVICE,
        DialOptions::default(),
        Arc::new(Parked),
        Box::new(|status| {
            if let Err(e) = status {
                error!("Dial failed: {}", e);
            }
        }),
    )?;

    let fds = Descriptors::Split {
        input: stdin().as_fd().try_clone_to_owned()?,
        output: stdout().as_fd().try_clone_to_owned()?,
    };
    let br = bridge_fds(
        conn,
        fds,
        Some(Box::new(|| info!("stdin/stdout closed"))),
        BridgeOptions::default().with_idle_timeout(idle),
    )?;
    info!("Connected as conn {}", br.conn_id());

    br.closed().await;
    Ok(())
}

fn get_arg(args: &[String], name: &str) -> Result<String, String> {
    let pos = args
        .iter()
        .position(|a| a == name)
        .ok_or_else(|| format!("missing argument: {}", name))?;
    args.get(pos + 1)
        .cloned()
        .ok_or_else(|| format!("missing value for {}", name))
}
