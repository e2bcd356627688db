//! Reusable resources shared across connections
//!
//! - `ConnPool`: bounded LIFO store of idle upstream connections
//! - `BufferPool`: free list of scratch byte buffers for the proxy loop

mod buffer;
mod conn_pool;

pub use buffer::{
    BufferPool, BufferPoolStats, PooledBuffer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE,
    DEFAULT_PREWARM,
};
pub use conn_pool::{CloseFn, ConnPool, DialFn};
