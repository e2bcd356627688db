//! Stream transforms applied to proxied bytes
//!
//! Handlers run once per read event. Named chains from the configuration are
//! built into `MiddlewareChain`s at startup; each server direction composes
//! its referenced chains into a `Pipeline`.

pub mod chain;
pub mod compression;
pub mod handler;
pub mod pipeline;

pub use chain::{constructor_fn, Constructor, MiddlewareChain};
pub use compression::{CompressionConstructor, DecompressionConstructor, GunzipHandler, GzipHandler};
pub use handler::{handler_fn, ConnHandler, Direction, HandlerContext, Passthrough};
pub use pipeline::{ChainRegistry, Pipeline};
