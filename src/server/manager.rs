//! Servers and their accept loops

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::config::{Runtime, ServerConfig};
use crate::error::{LantasError, Result};
use crate::middleware::{ChainRegistry, Pipeline};
use crate::pool::BufferPool;
use crate::server::listener::{Listener, TlsFiles};
use crate::server::proxy::Proxy;
use crate::upstream::UpstreamManager;

/// Shared, startup-built state every server draws from
#[derive(Clone)]
pub struct ServerContext {
    pub chains: Arc<ChainRegistry>,
    pub upstreams: Arc<UpstreamManager>,
    pub buffers: Arc<BufferPool>,
    /// Base directory for relative TLS credential paths
    pub root_dir: PathBuf,
}

/// One configured listener set proxying to one upstream
pub struct Server {
    name: String,
    proxy: Arc<Proxy>,
    listeners: Vec<Listener>,
    local_addrs: Vec<SocketAddr>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Build the server's pipelines and bind every listen address
    pub async fn bind(
        name: String,
        config: &ServerConfig,
        ctx: &ServerContext,
        token: CancellationToken,
    ) -> Result<Self> {
        let upstream_name = config.upstream().ok_or_else(|| {
            LantasError::InvalidConfig(format!("{} has no upstream", name))
        })?;
        let upstream = ctx.upstreams.get(upstream_name)?;

        let prewrite = Pipeline::from_names(&ctx.chains, config.prewrite_chains())?;
        let postread = Pipeline::from_names(&ctx.chains, config.postread_chains())?;

        let tls = config
            .tls
            .as_ref()
            .map(|tls| TlsFiles::from_config(tls, &ctx.root_dir))
            .transpose()?;

        let mut listeners = Vec::with_capacity(config.listen_addresses().len());
        for address in config.listen_addresses() {
            listeners.push(Listener::bind(address, tls.as_ref(), config.reuse_port()).await?);
        }
        let local_addrs = listeners
            .iter()
            .map(Listener::local_addr)
            .collect::<Result<Vec<_>>>()?;

        info!(
            server = %name,
            upstream = %upstream_name,
            prewrite = ?prewrite,
            postread = ?postread,
            "Server configured"
        );

        Ok(Self {
            name,
            proxy: Arc::new(Proxy::new(upstream, prewrite, postread, ctx.buffers.clone())),
            listeners,
            local_addrs,
            token,
            tasks: Vec::new(),
        })
    }

    /// Spawn one accept loop per bound listener
    pub fn start(&mut self) {
        for listener in self.listeners.drain(..) {
            let proxy = self.proxy.clone();
            let token = self.token.clone();
            let name = self.name.clone();
            self.tasks
                .push(tokio::spawn(accept_loop(name, listener, proxy, token)));
        }
    }

    /// Stop accepting and cancel every connection of this server
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for every accept loop to exit
    pub async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(server = %self.name, error = %e, "Accept loop task failed");
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound addresses, in configured order
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }
}

#[instrument(skip_all, fields(server = %name, listen = %listener.address()))]
async fn accept_loop(
    name: String,
    listener: Listener,
    proxy: Arc<Proxy>,
    token: CancellationToken,
) {
    info!("Accepting connections");
    let tls = listener.tls_acceptor();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(proxy.clone().serve(
                            stream,
                            peer,
                            tls.clone(),
                            token.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = token.cancelled() => {
                info!("Listener shutting down");
                break;
            }
        }
    }
}

/// Every configured server, sharing one cancellation root
pub struct ServerManager {
    servers: Vec<Server>,
    token: CancellationToken,
}

impl ServerManager {
    /// Bind every server; the first failure aborts and drops whatever was bound
    pub async fn new(runtime: &Runtime, ctx: &ServerContext) -> Result<Self> {
        let token = CancellationToken::new();
        let mut servers = Vec::with_capacity(runtime.servers().len());
        for (i, config) in runtime.servers().iter().enumerate() {
            let server =
                Server::bind(format!("servers[{}]", i), config, ctx, token.child_token()).await?;
            servers.push(server);
        }
        Ok(Self { servers, token })
    }

    pub fn start_all(&mut self) {
        for server in &mut self.servers {
            server.start();
        }
        info!(servers = self.servers.len(), "All servers started");
    }

    /// Cancel every server and all of their connections
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn wait(&mut self) {
        for server in &mut self.servers {
            server.wait().await;
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}
