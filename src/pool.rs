//! Fixed-size buffer pool for the local read path.
//!
//! The pool bounds how much data a bridge may have read from its local
//! endpoint but not yet seen acknowledged by the remote connection. When every
//! buffer is on loan, [`BufferPool::alloc`] returns `None` and the bridge
//! stops reading until a remote write completes.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Size of one bridge read buffer (32 KB)
pub const BRIDGE_MSG_SIZE: usize = 32 * 1024;

/// Number of read buffers a bridge may have in flight
pub const BRIDGE_POOL_SIZE: usize = 16;

/// Source of pooled read buffers.
pub trait BufferPool: Send + Sync {
    /// Borrow a buffer, or `None` when the pool is exhausted.
    fn alloc(&self) -> Option<PooledBuf>;
}

/// Where a [`PooledBuf`] goes when it is dropped.
pub trait Recycle: Send + Sync {
    fn recycle(&self, buf: BytesMut);
}

/// A buffer on loan from a pool.
///
/// The buffer goes back to its pool exactly once, when the value is dropped.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    filled: usize,
    home: Arc<dyn Recycle>,
}

impl PooledBuf {
    /// Wrap `buf` so that it is handed to `home` on drop.
    ///
    /// The whole initialized length of `buf` is usable read space.
    pub fn new(buf: BytesMut, home: Arc<dyn Recycle>) -> Self {
        Self {
            buf: Some(buf),
            filled: 0,
            home,
        }
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Mark the first `n` bytes as holding data.
    pub fn set_filled(&mut self, n: usize) {
        self.filled = n.min(self.capacity());
    }

    /// The bytes that hold data.
    pub fn filled(&self) -> &[u8] {
        match &self.buf {
            Some(b) => &b[..self.filled],
            None => &[],
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.filled()
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.capacity())
            .field("filled", &self.filled)
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.home.recycle(buf);
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently on loan
    pub outstanding: usize,
    /// Successful allocations
    pub allocations: u64,
    /// Buffers given back
    pub returns: u64,
    /// Allocations refused because the pool was exhausted
    pub exhausted: u64,
}

struct PoolInner {
    obj_size: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    returns: AtomicU64,
    exhausted: AtomicU64,
}

impl Recycle for PoolInner {
    fn recycle(&self, buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.returns.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut free) = self.free.lock() {
            free.push(buf);
        }
    }
}

/// Pool of at most `capacity` concurrently borrowed buffers of `obj_size`
/// bytes each. Buffers are allocated lazily and reused.
#[derive(Clone)]
pub struct FixedPool {
    inner: Arc<PoolInner>,
}

impl FixedPool {
    pub fn new(obj_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                obj_size,
                capacity,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
                returns: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Size of each buffer.
    pub fn obj_size(&self) -> usize {
        self.inner.obj_size
    }

    /// Buffers currently on loan.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding(),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            returns: self.inner.returns.load(Ordering::Relaxed),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl Default for FixedPool {
    fn default() -> Self {
        Self::new(BRIDGE_MSG_SIZE, BRIDGE_POOL_SIZE)
    }
}

impl BufferPool for FixedPool {
    fn alloc(&self) -> Option<PooledBuf> {
        let inner = &self.inner;
        let reserved = inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < inner.capacity).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            inner.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.allocations.fetch_add(1, Ordering::Relaxed);

        let reused = inner.free.lock().ok().and_then(|mut free| free.pop());
        let buf = reused.unwrap_or_else(|| BytesMut::zeroed(inner.obj_size));
        Some(PooledBuf::new(buf, self.inner.clone()))
    }
}

impl fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedPool")
            .field("obj_size", &self.inner.obj_size)
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
