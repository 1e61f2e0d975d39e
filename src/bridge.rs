//! Bridge between a local endpoint and a remote overlay connection.
//!
//! ```text
//!   local endpoint ──read──▶ [pooled buffer] ──write──▶ remote connection
//!   local endpoint ◀──try_write── on_data(chunk) ◀──push── remote connection
//! ```
//!
//! Each direction is driven by its own source: a read task for the local
//! endpoint, the connection's push callback for the remote side. Both consult
//! the same [`BridgeState`] so that EOF on one side only half-closes the other
//! and the session is torn down exactly once.
//!
//! Local reads are bounded by a [`BufferPool`]. Every chunk read holds one
//! pooled buffer until the remote write carrying it completes; when the pool
//! is exhausted reading pauses until the next completion.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::local::{LocalEndpoint, LocalHandle};
use crate::overlay::{DataHandler, RemoteConn, RemoteData, RemoteError, WriteBuf};
use crate::pool::{BufferPool, FixedPool, PooledBuf, BRIDGE_MSG_SIZE, BRIDGE_POOL_SIZE};
use crate::state::{BridgeState, EofAction, Side};

/// Bridge construction options.
#[derive(Clone)]
pub struct BridgeOptions {
    /// Size of each local read buffer
    pub msg_size: usize,
    /// Maximum number of read buffers in flight
    pub pool_size: usize,
    /// Use this pool instead of creating one per bridge
    pub pool: Option<Arc<dyn BufferPool>>,
    /// Initial idle timeout; zero disables it
    pub idle_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            msg_size: BRIDGE_MSG_SIZE,
            pool_size: BRIDGE_POOL_SIZE,
            pool: None,
            idle_timeout: Duration::ZERO,
        }
    }
}

impl BridgeOptions {
    pub fn with_pool(mut self, pool: Arc<dyn BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_pool_size(mut self, msg_size: usize, pool_size: usize) -> Self {
        self.msg_size = msg_size;
        self.pool_size = pool_size;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn make_pool(&self) -> Arc<dyn BufferPool> {
        match &self.pool {
            Some(pool) => pool.clone(),
            None => Arc::new(FixedPool::new(self.msg_size, self.pool_size)),
        }
    }
}

/// Bridge a remote connection to a local handle.
///
/// Datagram sockets must already be connected to a peer. On success the
/// bridge runs until both directions reach EOF, either side fails, the idle
/// timeout expires, or [`Bridge::close`] is called.
pub fn bridge(conn: Arc<dyn RemoteConn>, handle: LocalHandle, opts: BridgeOptions) -> Result<Bridge> {
    if let LocalHandle::Udp(sock) = &handle {
        if let Err(e) = sock.peer_addr() {
            warn!("cannot bridge unconnected socket: {}", e);
            return Err(Error::InvalidArgument("datagram socket is not connected".into()));
        }
    }
    attach(conn, LocalEndpoint::new(handle, None), opts)
}

pub(crate) fn attach(
    conn: Arc<dyn RemoteConn>,
    endpoint: LocalEndpoint,
    opts: BridgeOptions,
) -> Result<Bridge> {
    let id = conn.conn_id();
    if tokio::runtime::Handle::try_current().is_err() {
        warn!("br[{}] failed to start reading handle: no runtime", id);
        return Err(Error::ConnectionAborted);
    }

    let endpoint = Arc::new(endpoint);
    let session = Session::new(conn.clone(), endpoint.clone(), opts.make_pool());

    if let Err(e) = conn.set_data_handler(session.clone()) {
        warn!("br[{}] failed to bridge connection: {}", id, e);
        session.cancel.cancel();
        return Err(Error::ConnectionReset);
    }

    session.lock().reading = true;
    tokio::spawn(read_loop(session.clone(), endpoint));

    if !opts.idle_timeout.is_zero() {
        session.set_idle_timeout(opts.idle_timeout);
    }
    debug!("br[{}] connected", id);

    Ok(Bridge { session })
}

/// Handle to a running bridge.
///
/// Dropping the handle does not stop the bridge.
#[derive(Clone)]
pub struct Bridge {
    session: Arc<Session>,
}

impl Bridge {
    /// Id of the bridged remote connection.
    pub fn conn_id(&self) -> u32 {
        self.session.id
    }

    pub fn state(&self) -> BridgeState {
        self.session.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// `true` while local reads are paused for lack of buffers.
    pub fn is_throttled(&self) -> bool {
        self.session.lock().throttled
    }

    /// Set the idle timeout. `Duration::ZERO` disables it.
    pub fn set_idle_timeout(&self, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState);
        }
        self.session.set_idle_timeout(timeout);
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.session.lock().idle_timeout
    }

    /// Describe the local side, e.g. `"tcp: 127.0.0.1:5000 -> 127.0.0.1:40112"`.
    pub fn info(&self) -> Result<String> {
        let local = self.session.lock().local.clone();
        match local {
            Some(local) => local.info(),
            None => Err(Error::InvalidState),
        }
    }

    /// Tear the bridge down. Idempotent.
    pub fn close(&self) {
        self.session.teardown();
    }

    /// Wait until the bridge is torn down and the remote connection has
    /// finished closing.
    pub async fn closed(&self) {
        self.session.released.cancelled().await;
    }
}

/// Result of one local read.
enum LocalRead {
    Data(PooledBuf),
    Eof,
    Error(io::Error),
}

/// Outcome of asking for the next read buffer.
enum NextBuf {
    Ready(PooledBuf),
    Stalled,
    Closed,
}

struct SessionState {
    state: BridgeState,
    throttled: bool,
    reading: bool,
    idle_timeout: Duration,
    local: Option<Arc<LocalEndpoint>>,
    pool: Option<Arc<dyn BufferPool>>,
}

struct Session {
    id: u32,
    conn: Arc<dyn RemoteConn>,
    connectionless: bool,
    state: Mutex<SessionState>,
    resume: Notify,
    cancel: CancellationToken,
    released: CancellationToken,
    idler: Deadline,
}

impl Session {
    fn new(
        conn: Arc<dyn RemoteConn>,
        local: Arc<LocalEndpoint>,
        pool: Arc<dyn BufferPool>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let weak = weak.clone();
            let idler = Deadline::spawn(
                move || {
                    if let Some(session) = weak.upgrade() {
                        session.on_idle();
                    }
                },
                cancel.clone(),
            );
            Session {
                id: conn.conn_id(),
                connectionless: local.is_connectionless(),
                conn,
                state: Mutex::new(SessionState {
                    state: BridgeState::Active,
                    throttled: false,
                    reading: false,
                    idle_timeout: Duration::ZERO,
                    local: Some(local),
                    pool: Some(pool),
                }),
                resume: Notify::new(),
                cancel,
                released: CancellationToken::new(),
                idler,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch_idle(&self, st: &SessionState) {
        if !st.idle_timeout.is_zero() {
            self.idler.arm(st.idle_timeout);
        }
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        let mut st = self.lock();
        st.idle_timeout = timeout;
        if timeout.is_zero() {
            self.idler.disarm();
        } else {
            self.idler.arm(timeout);
        }
    }

    fn on_idle(&self) {
        debug!("br[{}] closing bridge due to idle timeout", self.id);
        self.teardown();
    }

    /// Borrow the next read buffer. An exhausted pool stalls the reader; the
    /// stall and the buffer returns in [`Session::on_remote_write`] are
    /// serialized by the state lock so a resume cannot be missed.
    fn next_buffer(&self) -> NextBuf {
        let mut st = self.lock();
        if st.state.is_closed() {
            return NextBuf::Closed;
        }
        let Some(pool) = st.pool.as_ref() else {
            return NextBuf::Closed;
        };
        match pool.alloc() {
            Some(buf) if buf.capacity() > 0 => NextBuf::Ready(buf),
            // a zero-capacity buffer means exhausted, same as none at all
            _ => {
                self.touch_idle(&st);
                if !st.throttled {
                    trace!("br[{}] stalled", self.id);
                    st.throttled = true;
                }
                NextBuf::Stalled
            }
        }
    }

    fn on_local_read(self: &Arc<Self>, event: LocalRead) {
        let mut st = self.lock();
        if st.state.is_closed() {
            return;
        }
        self.touch_idle(&st);

        match event {
            LocalRead::Data(buf) => {
                drop(st);
                self.forward(buf);
            }
            LocalRead::Eof => {
                let action = st.state.on_eof(Side::Local, self.connectionless);
                drop(st);
                match action {
                    EofAction::Teardown => {
                        trace!("br[{}] both sides are EOF", self.id);
                        self.teardown();
                    }
                    EofAction::HalfClose => {
                        trace!("br[{}] received EOF from local", self.id);
                        if let Err(e) = self.conn.close_write() {
                            warn!("br[{}] close_write failed: {}", self.id, e);
                            self.teardown();
                        }
                    }
                    EofAction::Ignore => {}
                }
            }
            LocalRead::Error(e) => {
                drop(st);
                warn!("br[{}] err = {}", self.id, e);
                self.teardown();
            }
        }
    }

    fn forward(self: &Arc<Self>, buf: PooledBuf) {
        let len = buf.filled().len();
        trace!("br[{}] sending {} bytes", self.id, len);

        let session = self.clone();
        let submitted = self.conn.write(
            Box::new(buf),
            Box::new(move |status, buf| session.on_remote_write(status, buf)),
        );
        if let Err(e) = submitted {
            warn!("br[{}] write failed: {}", self.id, e);
            self.teardown();
        }
    }

    fn on_remote_write(&self, status: std::result::Result<usize, RemoteError>, buf: WriteBuf) {
        let mut st = self.lock();
        // back to the pool before anything else
        drop(buf);

        if let Err(e) = status {
            drop(st);
            debug!("br[{}] write failed: {}", self.id, e);
            self.teardown();
            return;
        }

        if st.throttled && !st.state.is_closed() {
            st.throttled = false;
            if st.reading {
                trace!("br[{}] unstalled", self.id);
                self.resume.notify_one();
            } else {
                drop(st);
                warn!("br[{}] failed to resume reading handle", self.id);
                self.teardown();
            }
        }
    }

    fn on_half_close(&self, result: io::Result<()>) {
        match result {
            Ok(()) => {}
            // the handle was closed before the shutdown got to it
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!("br[{}] shutdown superseded: {}", self.id, e);
            }
            Err(e) => {
                warn!("br[{}] shutdown failed: {}", self.id, e);
                self.teardown();
            }
        }
    }

    /// Idempotent teardown: close the local side, then the remote connection;
    /// the pool is released once the remote close completes.
    fn teardown(&self) {
        let (local, pool) = {
            let mut st = self.lock();
            if !st.state.close() {
                return;
            }
            st.throttled = false;
            (st.local.take(), st.pool.take())
        };
        debug!("br[{}] closing", self.id);

        self.cancel.cancel();
        drop(local);

        let id = self.id;
        let released = self.released.clone();
        self.conn.close(Some(Box::new(move || {
            drop(pool);
            trace!("br[{}] released", id);
            released.cancel();
        })));
    }
}

impl DataHandler for Session {
    fn on_data(&self, data: RemoteData<'_>) -> usize {
        let st = self.lock();
        if st.state.is_closed() {
            return 0;
        }
        self.touch_idle(&st);
        let Some(local) = st.local.clone() else {
            return 0;
        };
        drop(st);

        match data {
            RemoteData::Bytes(chunk) => {
                trace!("br[{}] received {} bytes from remote", self.id, chunk.len());
                match local.try_write(chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(e) => {
                        warn!("br[{}] write failed: {}", self.id, e);
                        self.teardown();
                        0
                    }
                }
            }
            RemoteData::Eof => {
                let action = self.lock().state.on_eof(Side::Remote, self.connectionless);
                match action {
                    EofAction::Teardown => {
                        trace!("br[{}] both sides are EOF", self.id);
                        self.teardown();
                    }
                    EofAction::HalfClose => {
                        trace!("br[{}] received EOF from remote", self.id);
                        self.on_half_close(local.shutdown_write());
                    }
                    EofAction::Ignore => {}
                }
                0
            }
            RemoteData::Closed => {
                debug!("br[{}] closing bridge", self.id);
                self.teardown();
                0
            }
            RemoteData::Error(e) => {
                warn!("br[{}] closing bridge due to error: {}", self.id, e);
                self.teardown();
                0
            }
        }
    }
}

/// Clears `reading` however the read task ends.
struct ReadingGuard(Arc<Session>);

impl Drop for ReadingGuard {
    fn drop(&mut self) {
        self.0.lock().reading = false;
    }
}

async fn read_loop(session: Arc<Session>, input: Arc<LocalEndpoint>) {
    let guard = ReadingGuard(session.clone());
    let cancel = session.cancel.clone();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut buf = match session.next_buffer() {
            NextBuf::Ready(buf) => buf,
            NextBuf::Closed => break,
            NextBuf::Stalled => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = session.resume.notified() => continue,
                }
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            res = input.read(&mut buf) => res,
        };

        let event = match result {
            Ok(0) if session.connectionless => continue,
            Ok(0) => LocalRead::Eof,
            Ok(n) => {
                buf.set_filled(n);
                LocalRead::Data(buf)
            }
            Err(e) => LocalRead::Error(e),
        };
        let last = !matches!(event, LocalRead::Data(_));
        session.on_local_read(event);
        if last {
            break;
        }
    }

    drop(input);
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::unix::pipe;
    use tokio::net::{UdpSocket, UnixStream};

    use crate::overlay::WriteCallback;

    /// Records everything the bridge does to the remote side. Writes stay
    /// pending until the test completes them.
    #[derive(Default)]
    struct RecordingConn {
        handler: Mutex<Option<Arc<dyn DataHandler>>>,
        written: Mutex<Vec<Vec<u8>>>,
        pending: Mutex<VecDeque<(WriteBuf, WriteCallback)>>,
        close_writes: AtomicUsize,
        closes: AtomicUsize,
        refuse_handler: AtomicBool,
        refuse_writes: AtomicBool,
    }

    impl RecordingConn {
        fn push(&self, data: RemoteData<'_>) -> usize {
            let handler = self.handler.lock().unwrap().clone();
            handler.map_or(0, |h| h.on_data(data))
        }

        fn complete_next(&self, status: std::result::Result<(), RemoteError>) -> bool {
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some((buf, done)) => {
                    let len = bytes(&buf).len();
                    done(status.map(|_| len), buf);
                    true
                }
                None => false,
            }
        }

        fn written_total(&self) -> usize {
            self.written.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    impl RemoteConn for RecordingConn {
        fn conn_id(&self) -> u32 {
            7
        }

        fn set_data_handler(&self, handler: Arc<dyn DataHandler>) -> std::result::Result<(), RemoteError> {
            if self.refuse_handler.load(Ordering::SeqCst) {
                return Err(RemoteError::InvalidState);
            }
            *self.handler.lock().unwrap() = Some(handler);
            Ok(())
        }

        fn write(&self, data: WriteBuf, done: WriteCallback) -> std::result::Result<(), RemoteError> {
            if self.refuse_writes.load(Ordering::SeqCst) {
                return Err(RemoteError::ConnClosed);
            }
            self.written.lock().unwrap().push(bytes(&data).to_vec());
            self.pending.lock().unwrap().push_back((data, done));
            Ok(())
        }

        fn close_write(&self) -> std::result::Result<(), RemoteError> {
            self.close_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self, done: Option<crate::overlay::CloseCallback>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.handler.lock().unwrap().take();
            if let Some(done) = done {
                tokio::spawn(async move { done() });
            }
        }
    }

    fn bytes(buf: &WriteBuf) -> &[u8] {
        (**buf).as_ref()
    }

    async fn eventually(what: &str, f: impl Fn() -> bool) {
        for _ in 0..400 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn setup(opts: BridgeOptions) -> (Arc<RecordingConn>, Bridge, UnixStream) {
        let conn = Arc::new(RecordingConn::default());
        let (local, peer) = UnixStream::pair().unwrap();
        let br = bridge(conn.clone(), LocalHandle::Unix(local), opts).unwrap();
        (conn, br, peer)
    }

    #[tokio::test]
    async fn test_local_data_is_forwarded() {
        let (conn, br, mut peer) = setup(BridgeOptions::default());
        peer.write_all(b"hello").await.unwrap();

        eventually("remote write", || conn.written_total() == 5).await;
        assert_eq!(conn.written.lock().unwrap()[0], b"hello");
        assert!(conn.complete_next(Ok(())));
        assert!(!br.is_closed());
    }

    #[tokio::test]
    async fn test_remote_data_is_written_locally() {
        let (conn, _br, mut peer) = setup(BridgeOptions::default());

        assert_eq!(conn.push(RemoteData::Bytes(b"from remote")), 11);
        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from remote");
    }

    #[tokio::test]
    async fn test_large_read_is_chunked_by_buffer_size() {
        let pool = Arc::new(FixedPool::default());
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool(pool.clone()));

        let data = vec![0x5au8; 40 * 1024];
        peer.write_all(&data).await.unwrap();

        eventually("40 KiB forwarded", || conn.written_total() == data.len()).await;
        assert!(conn
            .written
            .lock()
            .unwrap()
            .iter()
            .all(|w| w.len() <= BRIDGE_MSG_SIZE));
        assert!(!br.is_throttled());

        while conn.complete_next(Ok(())) {}
        // only the buffer of the pending read is still out
        eventually("buffers returned", || pool.outstanding() == 1).await;
    }

    #[tokio::test]
    async fn test_exhausted_pool_throttles_until_write_completes() {
        let pool = Arc::new(FixedPool::new(4, 1));
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool(pool.clone()));

        peer.write_all(b"abcdefgh").await.unwrap();
        eventually("first chunk", || conn.written_total() == 4).await;
        eventually("throttle", || br.is_throttled()).await;
        assert_eq!(pool.outstanding(), 1);

        // nothing more is read while the only buffer is on loan
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.written_total(), 4);

        assert!(conn.complete_next(Ok(())));
        eventually("second chunk", || conn.written_total() == 8).await;
        assert!(conn.complete_next(Ok(())));

        let written = conn.written.lock().unwrap().concat();
        assert_eq!(written, b"abcdefgh");
        assert!(pool.stats().exhausted >= 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_buffers_throttle_instead_of_eof() {
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool_size(0, 4));

        peer.write_all(b"payload").await.unwrap();
        eventually("throttle", || br.is_throttled()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(br.state(), BridgeState::Active);
        assert_eq!(conn.close_writes.load(Ordering::SeqCst), 0);
        assert_eq!(conn.written_total(), 0);
    }

    #[tokio::test]
    async fn test_superseded_half_close_is_ignored() {
        let (conn, br, _peer) = setup(BridgeOptions::default());
        conn.push(RemoteData::Eof);
        assert_eq!(br.state(), BridgeState::HalfClosed(Side::Remote));

        br.session
            .on_half_close(Err(io::Error::from(io::ErrorKind::NotConnected)));
        assert_eq!(br.state(), BridgeState::HalfClosed(Side::Remote));
        assert_eq!(conn.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_half_close_tears_down() {
        let (conn, br, _peer) = setup(BridgeOptions::default());
        conn.push(RemoteData::Eof);

        br.session
            .on_half_close(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(br.is_closed());
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipe_output_shut_before_remote_eof_stays_half_closed() {
        let conn = Arc::new(RecordingConn::default());
        let (_in_tx, in_rx) = pipe::pipe().unwrap();
        let (out_tx, _out_rx) = pipe::pipe().unwrap();
        let handle = LocalHandle::Pipes {
            input: in_rx,
            output: out_tx,
        };
        let br = bridge(conn.clone(), handle, BridgeOptions::default()).unwrap();

        // the output is already gone when the remote EOF arrives
        let local = br.session.lock().local.clone().unwrap();
        local.shutdown_write().unwrap();

        conn.push(RemoteData::Eof);
        assert_eq!(br.state(), BridgeState::HalfClosed(Side::Remote));
        assert_eq!(conn.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_eof_half_closes_remote_then_remote_eof_closes() {
        let (conn, br, mut peer) = setup(BridgeOptions::default());

        peer.shutdown().await.unwrap();
        eventually("close_write", || conn.close_writes.load(Ordering::SeqCst) == 1).await;
        assert_eq!(br.state(), BridgeState::HalfClosed(Side::Local));
        assert_eq!(conn.closes.load(Ordering::SeqCst), 0);

        // remote still delivers after local EOF
        assert_eq!(conn.push(RemoteData::Bytes(b"late")), 4);

        conn.push(RemoteData::Eof);
        assert!(br.is_closed());
        tokio::time::timeout(Duration::from_secs(2), br.closed())
            .await
            .unwrap();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);

        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"late");
    }

    #[tokio::test]
    async fn test_remote_eof_half_closes_local_then_local_eof_closes() {
        let (conn, br, mut peer) = setup(BridgeOptions::default());

        conn.push(RemoteData::Bytes(b"bye"));
        conn.push(RemoteData::Eof);
        assert_eq!(br.state(), BridgeState::HalfClosed(Side::Remote));

        let mut got = Vec::new();
        peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");

        // local direction keeps flowing
        peer.write_all(b"more").await.unwrap();
        eventually("write after remote EOF", || conn.written_total() == 4).await;
        conn.complete_next(Ok(()));

        peer.shutdown().await.unwrap();
        eventually("teardown", || br.is_closed()).await;
        assert_eq!(conn.close_writes.load(Ordering::SeqCst), 0);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_runs_once_and_returns_every_buffer() {
        let pool = Arc::new(FixedPool::new(16, 4));
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool(pool.clone()));

        peer.write_all(b"0123456789abcdef").await.unwrap();
        eventually("writes", || conn.written_total() == 16).await;

        conn.push(RemoteData::Error(RemoteError::ConnAborted));
        conn.push(RemoteData::Closed);
        br.close();
        br.close();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);

        // completions arriving after teardown only return their buffers
        while conn.complete_next(Ok(())) {}
        eventually("buffers returned", || pool.outstanding() == 0).await;
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        tokio::time::timeout(Duration::from_secs(2), br.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_completion_tears_down() {
        let pool = Arc::new(FixedPool::new(64, 2));
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool(pool.clone()));

        peer.write_all(b"x").await.unwrap();
        eventually("write", || conn.written_total() == 1).await;
        conn.complete_next(Err(RemoteError::Timeout));

        assert!(br.is_closed());
        eventually("buffers returned", || pool.outstanding() == 0).await;
    }

    #[tokio::test]
    async fn test_refused_write_submission_tears_down() {
        let pool = Arc::new(FixedPool::new(64, 2));
        let (conn, br, mut peer) = setup(BridgeOptions::default().with_pool(pool.clone()));
        conn.refuse_writes.store(true, Ordering::SeqCst);

        peer.write_all(b"x").await.unwrap();
        eventually("teardown", || br.is_closed()).await;
        eventually("buffer returned", || pool.outstanding() == 0).await;
    }

    #[tokio::test]
    async fn test_backpressure_never_overreports() {
        let (conn, br, _peer) = setup(BridgeOptions::default());
        let chunk = vec![1u8; 64 * 1024];

        let mut blocked = false;
        for _ in 0..1000 {
            let consumed = conn.push(RemoteData::Bytes(&chunk));
            assert!(consumed <= chunk.len());
            if consumed == 0 {
                blocked = true;
                break;
            }
        }
        assert!(blocked, "local socket never pushed back");
        assert!(!br.is_closed());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_quiet_bridge() {
        let (conn, br, _peer) =
            setup(BridgeOptions::default().with_idle_timeout(Duration::from_millis(50)));
        assert_eq!(br.idle_timeout(), Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(2), br.closed())
            .await
            .unwrap();
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(br.set_idle_timeout(Duration::ZERO), Err(Error::InvalidState)));
    }

    #[tokio::test]
    async fn test_traffic_postpones_idle_timeout() {
        let (conn, br, _peer) = setup(BridgeOptions::default());
        br.set_idle_timeout(Duration::from_millis(200)).unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            conn.push(RemoteData::Bytes(b"."));
        }
        assert!(!br.is_closed());

        br.set_idle_timeout(Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!br.is_closed());
    }

    #[tokio::test]
    async fn test_unconnected_udp_is_rejected() {
        let conn = Arc::new(RecordingConn::default());
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let res = bridge(conn.clone(), LocalHandle::Udp(sock), BridgeOptions::default());
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        assert!(conn.handler.lock().unwrap().is_none());
        assert_eq!(conn.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_udp_eof_tears_down_immediately() {
        let conn = Arc::new(RecordingConn::default());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.connect(peer.local_addr().unwrap()).await.unwrap();
        peer.connect(sock.local_addr().unwrap()).await.unwrap();

        let br = bridge(conn.clone(), LocalHandle::Udp(sock), BridgeOptions::default()).unwrap();
        assert!(br.info().unwrap().starts_with("udp: 127.0.0.1:"));

        peer.send(b"datagram").await.unwrap();
        eventually("datagram forwarded", || conn.written_total() == 8).await;
        conn.complete_next(Ok(()));

        assert_eq!(conn.push(RemoteData::Bytes(b"reply")), 5);
        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");

        conn.push(RemoteData::Eof);
        assert!(br.is_closed());
        assert_eq!(conn.close_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refused_handler_is_connection_reset() {
        let conn = Arc::new(RecordingConn::default());
        conn.refuse_handler.store(true, Ordering::SeqCst);
        let (local, _peer) = UnixStream::pair().unwrap();

        let res = bridge(conn, LocalHandle::Unix(local), BridgeOptions::default());
        assert!(matches!(res, Err(Error::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_info_after_close_is_invalid_state() {
        let (_conn, br, _peer) = setup(BridgeOptions::default());
        br.close();
        assert!(matches!(br.info(), Err(Error::InvalidState)));
    }
}
