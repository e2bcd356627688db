//! Top-level runtime wiring

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::Runtime;
use crate::error::{LantasError, Result};
use crate::middleware::ChainRegistry;
use crate::pool::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_PREWARM};
use crate::server::{Server, ServerContext, ServerManager};
use crate::upstream::{ConnTrack, UpstreamManager};

/// A configured proxy instance
pub struct Lantas {
    runtime: Runtime,
    root_dir: PathBuf,
    conn_track: ConnTrack,
    buffers: Option<Arc<BufferPool>>,
    servers: Option<ServerManager>,
}

impl Lantas {
    pub fn new(runtime: Runtime, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            root_dir: root_dir.into(),
            conn_track: ConnTrack::new(),
            buffers: None,
            servers: None,
        }
    }

    /// Load and validate `config_file`, then wrap it
    pub fn from_file(config_file: impl AsRef<Path>, root_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Runtime::from_file(config_file)?, root_dir))
    }

    /// Build every component, bind all listeners and start serving.
    ///
    /// Nothing accepts connections unless every step succeeds.
    pub async fn init(&mut self) -> Result<()> {
        if self.servers.is_some() {
            return Err(LantasError::Internal("already initialized".into()));
        }
        self.runtime.validate()?;

        let buffers = BufferPool::new(DEFAULT_PREWARM, DEFAULT_BUFFER_SIZE);
        let chains = ChainRegistry::from_config(&self.runtime.middleware_chains)?;
        info!(chains = chains.len(), "Middleware chains built");

        let upstreams = UpstreamManager::new(&self.runtime, self.conn_track.clone())?;

        let ctx = ServerContext {
            chains: Arc::new(chains),
            upstreams: Arc::new(upstreams),
            buffers: buffers.clone(),
            root_dir: self.root_dir.clone(),
        };
        let mut servers = ServerManager::new(&self.runtime, &ctx).await?;
        servers.start_all();

        self.buffers = Some(buffers);
        self.servers = Some(servers);
        Ok(())
    }

    /// Stop every server and cancel active connections
    pub fn shutdown(&self) {
        if let Some(servers) = &self.servers {
            info!("Shutting down servers");
            servers.shutdown();
        }
    }

    /// Resolve once every accept loop has exited
    pub async fn wait(&mut self) {
        if let Some(servers) = &mut self.servers {
            servers.wait().await;
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn servers(&self) -> &[Server] {
        self.servers
            .as_ref()
            .map(ServerManager::servers)
            .unwrap_or_default()
    }

    /// Live upstream connections that are not pooled
    pub fn conn_track(&self) -> &ConnTrack {
        &self.conn_track
    }

    pub fn buffer_pool(&self) -> Option<&Arc<BufferPool>> {
        self.buffers.as_ref()
    }
}
