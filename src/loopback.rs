//! In-memory overlay network.
//!
//! Services are registered with intercept rules and accept dialed connections
//! through a [`ServiceListener`]. Each connection is a pair of
//! [`LoopbackConn`]s joined by two frame queues. A per-side delivery task
//! pushes frames into that side's data handler, re-delivering whatever the
//! handler did not consume after a short delay. A write completes once the
//! peer has consumed all of it.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::overlay::{
    CloseCallback, ConnectCallback, DataHandler, DialOptions, HostAddr, OverlayContext,
    Protocol, RemoteConn, RemoteData, RemoteError, WriteBuf, WriteCallback,
};

/// Pause before re-delivering an unconsumed remainder.
const REDELIVERY_DELAY: Duration = Duration::from_millis(10);

/// Address/port rule that routes intercepted traffic to a service.
#[derive(Debug, Clone)]
pub struct Intercept {
    pub protocol: Protocol,
    pub address: HostAddr,
    pub ports: RangeInclusive<u16>,
}

impl Intercept {
    pub fn tcp(address: &str, ports: RangeInclusive<u16>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            address: HostAddr::parse(address),
            ports,
        }
    }

    fn matches(&self, protocol: Protocol, addr: &HostAddr, port: u16) -> bool {
        self.protocol == protocol && &self.address == addr && self.ports.contains(&port)
    }
}

/// A connection accepted by a hosted service.
pub struct Accepted {
    /// Server side of the connection; install a handler (or bridge it) to
    /// start receiving.
    pub conn: Arc<LoopbackConn>,
    /// Application data supplied by the dialer.
    pub app_data: Vec<u8>,
}

/// Stream of connections dialed to one service.
pub struct ServiceListener {
    name: String,
    rx: mpsc::UnboundedReceiver<Accepted>,
}

impl ServiceListener {
    pub fn service(&self) -> &str {
        &self.name
    }

    /// Next dialed connection, or `None` once the overlay is gone.
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.rx.recv().await
    }
}

struct Service {
    intercepts: Vec<Intercept>,
    accept: mpsc::UnboundedSender<Accepted>,
}

#[derive(Default)]
struct OverlayInner {
    services: Mutex<BTreeMap<String, Service>>,
    next_id: AtomicU32,
}

/// An overlay whose services all live in this process.
#[derive(Clone, Default)]
pub struct LoopbackOverlay {
    inner: Arc<OverlayInner>,
}

impl LoopbackOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `name`. Replaces any previous registration of the same name.
    pub fn register_service(&self, name: &str, intercepts: Vec<Intercept>) -> ServiceListener {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut services) = self.inner.services.lock() {
            services.insert(
                name.to_string(),
                Service {
                    intercepts,
                    accept: tx,
                },
            );
        }
        debug!("hosting service {}", name);
        ServiceListener {
            name: name.to_string(),
            rx,
        }
    }

    /// Two connected ends, not attached to any service.
    pub fn pair(&self) -> (Arc<LoopbackConn>, Arc<LoopbackConn>) {
        let a = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let b = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        pair(a, b)
    }
}

impl OverlayContext for LoopbackOverlay {
    fn service_for_addr(&self, protocol: Protocol, addr: &HostAddr, port: u16) -> Option<String> {
        let services = self.inner.services.lock().ok()?;
        services
            .iter()
            .find(|(_, svc)| svc.intercepts.iter().any(|i| i.matches(protocol, addr, port)))
            .map(|(name, _)| name.clone())
    }

    fn dial(
        &self,
        service: &str,
        opts: DialOptions,
        handler: Arc<dyn DataHandler>,
        done: ConnectCallback,
    ) -> Result<Arc<dyn RemoteConn>, RemoteError> {
        let accept = {
            let services = self
                .inner
                .services
                .lock()
                .map_err(|_| RemoteError::InvalidState)?;
            match services.get(service) {
                Some(svc) => svc.accept.clone(),
                None => return Err(RemoteError::ServiceUnavailable),
            }
        };

        let (client, server) = self.pair();
        client.set_data_handler(handler)?;
        let accepted = Accepted {
            conn: server,
            app_data: opts.app_data,
        };
        if accept.send(accepted).is_err() {
            debug!("service {} is no longer accepting", service);
            return Err(RemoteError::ServiceUnavailable);
        }
        trace!("conn[{}] dialed {}", client.id, service);

        tokio::spawn(async move { done(Ok(())) });
        Ok(client)
    }
}

/// A write in flight. Completes exactly once; dropping it unfinished reports
/// `ConnClosed`.
struct Outbound {
    data: Option<WriteBuf>,
    done: Option<WriteCallback>,
}

impl Outbound {
    fn bytes(&self) -> &[u8] {
        match &self.data {
            Some(d) => (**d).as_ref(),
            None => &[],
        }
    }

    fn complete(mut self, status: Result<usize, RemoteError>) {
        if let (Some(data), Some(done)) = (self.data.take(), self.done.take()) {
            done(status, data);
        }
    }

    /// Give up without running the completion.
    fn defuse(mut self) {
        self.done.take();
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        if let (Some(data), Some(done)) = (self.data.take(), self.done.take()) {
            done(Err(RemoteError::ConnClosed), data);
        }
    }
}

enum Frame {
    Data(Outbound),
    Eof,
    Closed,
}

/// Receiving half of one side.
struct Inbox {
    handler: Mutex<Option<Arc<dyn DataHandler>>>,
    closed: AtomicBool,
    wake: Notify,
}

impl Inbox {
    fn handler(&self) -> Option<Arc<dyn DataHandler>> {
        self.handler.lock().ok().and_then(|h| h.clone())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until a handler is installed. `None` once this side is closed.
    async fn ready(&self) -> Option<Arc<dyn DataHandler>> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(h) = self.handler() {
                return Some(h);
            }
            self.wake.notified().await;
        }
    }
}

/// One end of an in-memory overlay connection.
pub struct LoopbackConn {
    id: u32,
    inbox: Arc<Inbox>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    write_closed: AtomicBool,
}

/// Two connected ends with the given ids. Must be called inside a runtime.
pub fn pair(a: u32, b: u32) -> (Arc<LoopbackConn>, Arc<LoopbackConn>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    // a writes into b's queue and vice versa
    let a = LoopbackConn::new(a, b_tx, a_rx);
    let b = LoopbackConn::new(b, a_tx, b_rx);
    (a, b)
}

impl LoopbackConn {
    fn new(
        id: u32,
        outbox: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Arc<Self> {
        let inbox = Arc::new(Inbox {
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        });
        tokio::spawn(deliver(id, inbox.clone(), inbound));
        Arc::new(Self {
            id,
            inbox,
            outbox: Mutex::new(Some(outbox)),
            write_closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    fn send(&self, frame: Frame) -> Result<(), Frame> {
        let outbox = match self.outbox.lock() {
            Ok(outbox) => outbox,
            Err(_) => return Err(frame),
        };
        match outbox.as_ref() {
            Some(tx) => tx.send(frame).map_err(|e| e.0),
            None => Err(frame),
        }
    }
}

impl RemoteConn for LoopbackConn {
    fn conn_id(&self) -> u32 {
        self.id
    }

    fn set_data_handler(&self, handler: Arc<dyn DataHandler>) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::ConnClosed);
        }
        let mut slot = self
            .inbox
            .handler
            .lock()
            .map_err(|_| RemoteError::InvalidState)?;
        *slot = Some(handler);
        drop(slot);
        self.inbox.wake.notify_one();
        Ok(())
    }

    fn write(&self, data: WriteBuf, done: WriteCallback) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::ConnClosed);
        }
        if self.write_closed.load(Ordering::Acquire) {
            return Err(RemoteError::InvalidState);
        }
        let out = Outbound {
            data: Some(data),
            done: Some(done),
        };
        match self.send(Frame::Data(out)) {
            Ok(()) => Ok(()),
            Err(Frame::Data(out)) => {
                out.defuse();
                Err(RemoteError::ConnClosed)
            }
            Err(_) => Err(RemoteError::ConnClosed),
        }
    }

    fn close_write(&self) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::ConnClosed);
        }
        if self.write_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!("conn[{}] write side closed", self.id);
        self.send(Frame::Eof).map_err(|_| RemoteError::ConnClosed)
    }

    fn close(&self, done: Option<CloseCallback>) {
        if !self.inbox.closed.swap(true, Ordering::AcqRel) {
            trace!("conn[{}] closing", self.id);
            if let Ok(mut handler) = self.inbox.handler.lock() {
                handler.take();
            }
            let _ = self.send(Frame::Closed);
            if let Ok(mut outbox) = self.outbox.lock() {
                outbox.take();
            }
            self.inbox.wake.notify_one();
        }
        if let Some(done) = done {
            tokio::spawn(async move { done() });
        }
    }
}

async fn deliver(id: u32, inbox: Arc<Inbox>, mut inbound: mpsc::UnboundedReceiver<Frame>) {
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => frame,
            _ = wait_closed(&inbox) => break,
        };
        let Some(handler) = inbox.ready().await else {
            break;
        };

        match frame {
            Some(Frame::Data(out)) => {
                if !push_data(id, &inbox, handler, out).await {
                    break;
                }
            }
            Some(Frame::Eof) => {
                handler.on_data(RemoteData::Eof);
            }
            Some(Frame::Closed) | None => {
                handler.on_data(RemoteData::Closed);
                break;
            }
        }
    }
    trace!("conn[{}] delivery finished", id);
}

async fn wait_closed(inbox: &Inbox) {
    while !inbox.is_closed() {
        inbox.wake.notified().await;
    }
}

/// Deliver one write until it is fully consumed. Returns `false` if this side
/// closed first.
async fn push_data(id: u32, inbox: &Inbox, mut handler: Arc<dyn DataHandler>, out: Outbound) -> bool {
    let total = out.bytes().len();
    let mut offset = 0;
    while offset < total {
        let consumed = handler.on_data(RemoteData::Bytes(&out.bytes()[offset..]));
        offset += consumed.min(total - offset);
        if offset == total {
            break;
        }
        trace!("conn[{}] {} bytes left, retrying", id, total - offset);
        tokio::time::sleep(REDELIVERY_DELAY).await;
        match inbox.ready().await {
            Some(h) => handler = h,
            None => return false,
        }
    }
    out.complete(Ok(total));
    true
}
