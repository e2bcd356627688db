//! Bounded connection pool with LIFO reuse
//!
//! Idle connections live in a fixed-size ring. `put` writes at the cursor and
//! advances it, overwriting (and evicting) the oldest entry once the ring is
//! full. `get` takes the slot just behind the cursor, so the most recently
//! returned connection is reused first. The lock only guards the ring
//! bookkeeping; dialing and closing always happen outside it.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LantasError, Result};

/// Creates a fresh connection when the pool is empty
pub type DialFn<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Closes a connection evicted from the pool
pub type CloseFn<C> = Arc<dyn Fn(C) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Ring<C> {
    store: Vec<Option<C>>,
    /// Next slot `put` writes to
    off: usize,
    /// Number of occupied slots
    count: usize,
}

/// Bounded, mutex-protected LIFO pool of reusable connections
pub struct ConnPool<C> {
    capacity: usize,
    ring: Mutex<Ring<C>>,
    dial: DialFn<C>,
    close: Option<CloseFn<C>>,
}

impl<C: Send + 'static> ConnPool<C> {
    /// Create a pool holding at most `capacity` idle connections.
    ///
    /// `dial` is required; without `close`, evicted connections are dropped.
    pub fn new(
        capacity: usize,
        dial: Option<DialFn<C>>,
        close: Option<CloseFn<C>>,
    ) -> Result<Self> {
        let dial = dial.ok_or_else(|| LantasError::Pool("dial function is required".into()))?;
        if capacity == 0 {
            return Err(LantasError::Pool("capacity must be at least 1".into()));
        }

        let mut store = Vec::with_capacity(capacity);
        store.resize_with(capacity, || None);

        Ok(Self {
            capacity,
            ring: Mutex::new(Ring {
                store,
                off: 0,
                count: 0,
            }),
            dial,
            close,
        })
    }

    /// Return a connection to the pool.
    ///
    /// When the pool is full the oldest entry is evicted and closed after
    /// the lock is released; a close failure is reported here even though
    /// the evicted connection has already left the pool.
    pub async fn put(&self, conn: C) -> Result<()> {
        let evicted = {
            let mut ring = self.ring.lock();
            let off = ring.off;
            let evicted = ring.store[off].replace(conn);
            ring.off = (off + 1) % self.capacity;
            if ring.count < self.capacity {
                ring.count += 1;
            }
            evicted
        };

        if let Some(old) = evicted {
            debug!(capacity = self.capacity, "Evicting oldest pooled connection");
            if let Some(close) = &self.close {
                close(old).await?;
            }
        }

        Ok(())
    }

    /// Take the most recently returned connection, or dial a new one.
    ///
    /// Never waits for an entry; an empty pool is a miss, not an error.
    pub async fn get(&self) -> Result<C> {
        let pooled = {
            let mut ring = self.ring.lock();
            if ring.count == 0 {
                None
            } else {
                let off = (ring.off + self.capacity - 1) % self.capacity;
                let conn = ring.store[off].take();
                ring.off = off;
                ring.count -= 1;
                conn
            }
        };

        match pooled {
            Some(conn) => Ok(conn),
            None => {
                debug!("Connection pool miss, dialing");
                (self.dial)().await
            }
        }
    }

    /// Number of idle connections currently pooled
    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
