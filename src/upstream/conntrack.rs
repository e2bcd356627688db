//! Bookkeeping for live upstream connections that are not pooled

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Inner {
    next_id: AtomicU64,
    live: RwLock<HashSet<u64>>,
}

/// Thread-safe set of live connection ids.
///
/// Observational only: nothing reads it to decide what to do with a
/// connection. Cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct ConnTrack {
    inner: Arc<Inner>,
}

impl ConnTrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id
    pub fn add(&self) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.live.write().insert(id);
        id
    }

    /// Forget a connection; returns false if it was not tracked
    pub fn remove(&self, id: u64) -> bool {
        self.inner.live.write().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.live.read().contains(&id)
    }

    /// Number of live tracked connections
    pub fn count(&self) -> usize {
        self.inner.live.read().len()
    }

    /// Register a connection for as long as the returned guard lives
    pub fn track(&self) -> TrackGuard {
        TrackGuard {
            id: self.add(),
            track: self.clone(),
        }
    }
}

/// Removes its connection from the tracker when dropped
#[derive(Debug)]
pub struct TrackGuard {
    id: u64,
    track: ConnTrack,
}

impl TrackGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.track.remove(self.id);
    }
}
