//! Lantas - TCP/TLS reverse proxy
//!
//! Accepts client connections, pairs each with a pooled or freshly dialed
//! upstream connection and forwards bytes both ways, optionally through
//! ordered middleware chains.
//!
//! ## Features
//!
//! - Plain TCP and TLS-terminating listeners
//! - Bounded LIFO keep-alive pools per upstream
//! - Gzip compression and decompression middleware per direction
//! - YAML configuration with startup validation

pub mod config;
pub mod error;
pub mod lantas;
pub mod middleware;
pub mod pool;
pub mod server;
pub mod upstream;

pub use config::Runtime;
pub use error::{LantasError, Result};
pub use lantas::Lantas;
