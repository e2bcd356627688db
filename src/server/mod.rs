//! Listeners, accept loops and the proxy loop

pub mod listener;
pub mod manager;
pub mod proxy;

pub use listener::{resolve, Listener, TlsFiles};
pub use manager::{Server, ServerContext, ServerManager};
pub use proxy::{Proxy, WRITE_TIMEOUT};
