//! Decorator chains of handler constructors
//!
//! A chain `[c0, c1, .., cn]` wraps a base handler `h` as `c0(c1(..cn(h)))`:
//! the first constructor listed is the outermost wrapper and runs first.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::MiddlewareChainConfig;
use crate::error::{LantasError, Result};
use crate::middleware::compression::{CompressionConstructor, DecompressionConstructor};
use crate::middleware::handler::ConnHandler;

/// Wraps the next handler in a new one
pub trait Constructor: Send + Sync {
    fn build(&self, next: Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>>;

    /// Scratch buffers the built handler consumes per read event
    fn buffer_depth(&self) -> usize;

    fn name(&self) -> &str {
        "custom"
    }
}

struct FnConstructor<F> {
    depth: usize,
    f: F,
}

impl<F> Constructor for FnConstructor<F>
where
    F: Fn(Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> + Send + Sync,
{
    fn build(&self, next: Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> {
        (self.f)(next)
    }

    fn buffer_depth(&self) -> usize {
        self.depth
    }
}

/// Build a constructor from a closure that consumes `depth` scratch buffers
pub fn constructor_fn<F>(depth: usize, f: F) -> Arc<dyn Constructor>
where
    F: Fn(Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> + Send + Sync + 'static,
{
    Arc::new(FnConstructor { depth, f })
}

/// Immutable, ordered list of constructors
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    constructors: Vec<Arc<dyn Constructor>>,
}

impl MiddlewareChain {
    pub fn new(constructors: impl IntoIterator<Item = Arc<dyn Constructor>>) -> Self {
        Self {
            constructors: constructors.into_iter().collect(),
        }
    }

    /// Build a chain from its configured steps
    pub fn from_config(name: &str, config: &MiddlewareChainConfig) -> Result<Self> {
        let mut constructors: Vec<Arc<dyn Constructor>> = Vec::with_capacity(config.steps.len());
        for (i, step) in config.steps.iter().enumerate() {
            let constructor: Arc<dyn Constructor> = match (&step.compression, &step.decompression) {
                (Some(codec), None) => Arc::new(CompressionConstructor::from_step(codec)?),
                (None, Some(codec)) => Arc::new(DecompressionConstructor::from_step(codec)?),
                _ => {
                    return Err(LantasError::InvalidConfig(format!(
                        "middleware_chains.{}.steps[{}] must set exactly one of compression or decompression",
                        name, i
                    )))
                }
            };
            constructors.push(constructor);
        }
        debug!(chain = name, steps = constructors.len(), "Built middleware chain");
        Ok(Self::new(constructors))
    }

    /// Compose every constructor around `handler`, outermost first
    pub fn then(&self, handler: Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> {
        self.constructors
            .iter()
            .rev()
            .try_fold(handler, |next, constructor| {
                debug!(constructor = constructor.name(), "Wrapping handler");
                constructor.build(next).map_err(|e| match e {
                    // construction errors keep their own classification
                    known @ (LantasError::UnknownAlgorithm { .. }
                    | LantasError::InvalidMiddlewareOption { .. }) => known,
                    other => LantasError::Pipeline(format!(
                        "failed building middleware chain: {}",
                        other
                    )),
                })
            })
    }

    /// New chain with `constructors` after this chain's own
    pub fn append(&self, constructors: impl IntoIterator<Item = Arc<dyn Constructor>>) -> Self {
        let mut all = self.constructors.clone();
        all.extend(constructors);
        Self { constructors: all }
    }

    /// New chain with every constructor of `other` after this chain's own
    pub fn extend(&self, other: &MiddlewareChain) -> Self {
        self.append(other.constructors.iter().cloned())
    }

    /// Scratch buffers consumed by a handler built from this chain
    pub fn buffer_depth(&self) -> usize {
        self.constructors.iter().map(|c| c.buffer_depth()).sum()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.constructors.iter().map(|c| c.name()))
            .finish()
    }
}
