//! Scratch buffer pool
//!
//! Buffers are handed out as `PooledBuffer` guards that go back to the free
//! list when dropped, so every exit path of a proxy loop releases them. The
//! free list is bounded; the number of buffers in flight is not.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default buffer size (16 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Buffers allocated up front
pub const DEFAULT_PREWARM: usize = 60;

/// Upper bound on idle buffers retained by the free list
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Snapshot of buffer pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers allocated because the free list was empty
    pub allocations: u64,
    /// Buffers served from the free list
    pub reuses: u64,
    /// Buffers dropped instead of returned (free list full or buffer oversized)
    pub drops: u64,
}

/// Pool of reusable byte buffers
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    drops: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `buffer_size` buffers with `prewarm` allocated up front
    pub fn new(prewarm: usize, buffer_size: usize) -> Arc<Self> {
        Self::with_max_idle(prewarm, buffer_size, DEFAULT_MAX_IDLE.max(prewarm))
    }

    pub fn with_max_idle(prewarm: usize, buffer_size: usize, max_idle: usize) -> Arc<Self> {
        let prewarm = prewarm.min(max_idle);
        let free = (0..prewarm)
            .map(|_| Vec::with_capacity(buffer_size))
            .collect();

        Arc::new(Self {
            free: Mutex::new(free),
            buffer_size,
            max_idle,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        })
    }

    /// Get an empty buffer with at least `buffer_size` capacity
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.free.lock().pop();
        let buf = match reused {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_size)
            }
        };

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Get a buffer pre-sized to `buffer_size` zero bytes, ready for reads
    pub fn get_read_buf(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = self.get();
        buf.resize(self.buffer_size, 0);
        buf
    }

    fn put(&self, mut buf: Vec<u8>) {
        // buffers that grew far past the nominal size are not worth keeping
        if buf.capacity() > self.buffer_size * 4 {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();

        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        } else {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers on the free list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// A buffer borrowed from a `BufferPool`, returned on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}
