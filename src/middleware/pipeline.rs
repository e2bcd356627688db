//! Per-direction pipelines assembled from named chains

use std::collections::HashMap;

use tracing::trace;

use crate::config::MiddlewareChainConfig;
use crate::error::{LantasError, Result};
use crate::middleware::chain::MiddlewareChain;
use crate::middleware::handler::{ConnHandler, HandlerContext, Passthrough};

/// Chains built once at startup, looked up by name when servers start
#[derive(Debug, Default, Clone)]
pub struct ChainRegistry {
    chains: HashMap<String, MiddlewareChain>,
}

impl ChainRegistry {
    pub fn from_config<'a>(
        configs: impl IntoIterator<Item = (&'a String, &'a MiddlewareChainConfig)>,
    ) -> Result<Self> {
        let chains = configs
            .into_iter()
            .map(|(name, config)| Ok((name.clone(), MiddlewareChain::from_config(name, config)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { chains })
    }

    pub fn get(&self, name: &str) -> Result<&MiddlewareChain> {
        self.chains
            .get(name)
            .ok_or_else(|| LantasError::UnknownMiddlewareChain(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

struct Stage {
    name: String,
    handler: Box<dyn ConnHandler>,
    depth: usize,
}

/// Ordered list of composed chains for one direction
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Compose the named chains, in order, from `registry`
    pub fn from_names<'a>(
        registry: &ChainRegistry,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self> {
        let mut pipeline = Self::default();
        for name in names {
            pipeline.push(name, registry.get(name)?)?;
        }
        Ok(pipeline)
    }

    /// Append a chain terminated by a pass-through handler
    pub fn push(&mut self, name: &str, chain: &MiddlewareChain) -> Result<()> {
        let handler = chain.then(Box::new(Passthrough))?;
        self.stages.push(Stage {
            name: name.to_string(),
            handler,
            depth: chain.buffer_depth(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Scratch buffers needed per read event: every stage's depth plus one
    /// for the final advance.
    pub fn chain_len(&self) -> usize {
        self.stages.iter().map(|s| s.depth).sum::<usize>() + 1
    }

    /// Run every chain over the current read; the first error aborts
    pub fn run(&self, ctx: &mut HandlerContext) -> Result<()> {
        for stage in &self.stages {
            trace!(chain = %stage.name, direction = %ctx.direction(), "Running middleware chain");
            stage.handler.handle(ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| &s.name))
            .finish()
    }
}
