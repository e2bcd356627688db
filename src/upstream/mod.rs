//! Named upstreams and the connections leased from them
//!
//! An upstream with `keepalive > 0` hands out connections from a `ConnPool`
//! and takes them back on `done`. Without keep-alive every lease is a fresh
//! dial, registered with the shared `ConnTrack` until it is closed.

mod conntrack;

pub use conntrack::{ConnTrack, TrackGuard};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::config::{Runtime, UpstreamConfig};
use crate::error::{LantasError, Result};
use crate::pool::{CloseFn, ConnPool, DialFn};

async fn connect(address: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| LantasError::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn shutdown(mut stream: TcpStream) -> Result<()> {
    stream
        .shutdown()
        .await
        .map_err(|e| LantasError::Close(e.to_string()))
}

/// One configured upstream
pub struct Upstream {
    name: String,
    address: String,
    pool: Option<ConnPool<TcpStream>>,
    track: ConnTrack,
}

impl Upstream {
    pub fn new(name: &str, config: &UpstreamConfig, track: ConnTrack) -> Result<Self> {
        let address = config
            .address()
            .ok_or_else(|| {
                LantasError::InvalidConfig(format!("upstream {} has no server address", name))
            })?
            .to_string();

        if config.tls {
            warn!(
                upstream = name,
                "TLS to upstreams is not supported, dialing plain TCP"
            );
        }

        let pool = if config.keepalive > 0 {
            let dial_address = address.clone();
            let dial: DialFn<TcpStream> = Arc::new(move || {
                let address = dial_address.clone();
                async move { connect(&address).await }.boxed()
            });
            let close: CloseFn<TcpStream> = Arc::new(|stream: TcpStream| shutdown(stream).boxed());
            Some(ConnPool::new(config.keepalive, Some(dial), Some(close))?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            address,
            pool,
            track,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Idle connections waiting in the pool
    pub fn idle(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.len())
    }

    /// Lease a connection: pooled if possible, otherwise freshly dialed
    #[instrument(skip(self), fields(upstream = %self.name))]
    pub async fn dial(self: &Arc<Self>) -> Result<UpstreamConn> {
        let (stream, guard) = match &self.pool {
            Some(pool) => (pool.get().await?, None),
            None => {
                let stream = connect(&self.address).await?;
                (stream, Some(self.track.track()))
            }
        };
        debug!(address = %self.address, "Upstream connection leased");

        Ok(UpstreamConn {
            stream,
            upstream: Arc::clone(self),
            _guard: guard,
        })
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// A live connection leased from an `Upstream`.
///
/// Consumed by `done` or `close`, so a lease can be released only once.
#[derive(Debug)]
pub struct UpstreamConn {
    stream: TcpStream,
    upstream: Arc<Upstream>,
    _guard: Option<TrackGuard>,
}

impl UpstreamConn {
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Return the connection for reuse, or close it if the upstream does not pool
    pub async fn done(self) -> Result<()> {
        let UpstreamConn {
            stream,
            upstream,
            _guard,
        } = self;
        match &upstream.pool {
            Some(pool) => pool.put(stream).await,
            None => shutdown(stream).await,
        }
    }

    /// Close the connection without returning it to the pool
    pub async fn close(self) -> Result<()> {
        shutdown(self.stream).await
    }
}

/// Every configured upstream, by name
#[derive(Debug)]
pub struct UpstreamManager {
    upstreams: HashMap<String, Arc<Upstream>>,
    track: ConnTrack,
}

impl UpstreamManager {
    pub fn new(runtime: &Runtime, track: ConnTrack) -> Result<Self> {
        let upstreams = runtime
            .upstreams
            .iter()
            .map(|(name, config)| {
                let upstream = Upstream::new(name, config, track.clone())?;
                info!(
                    upstream = %name,
                    address = %upstream.address(),
                    keepalive = config.keepalive,
                    "Upstream registered"
                );
                Ok((name.clone(), Arc::new(upstream)))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self { upstreams, track })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Upstream>> {
        self.upstreams
            .get(name)
            .cloned()
            .ok_or_else(|| LantasError::UnknownUpstream(name.to_string()))
    }

    pub fn conn_track(&self) -> &ConnTrack {
        &self.track
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
