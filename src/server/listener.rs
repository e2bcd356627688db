//! Listener construction: address resolution, TCP bind and optional TLS

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::config::{resolve_path, ServerTlsConfig};
use crate::error::{LantasError, Result};

/// Certificate and key files for a TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TlsFiles {
    /// Resolve configured paths against `root_dir`; empty paths are rejected
    pub fn from_config(config: &ServerTlsConfig, root_dir: &Path) -> Result<Self> {
        if config.cert_file.is_empty() {
            return Err(LantasError::Tls("certificate file path is empty".into()));
        }
        if config.key_file.is_empty() {
            return Err(LantasError::Tls("key file path is empty".into()));
        }
        Ok(Self {
            cert_file: resolve_path(root_dir, &config.cert_file),
            key_file: resolve_path(root_dir, &config.key_file),
        })
    }

    /// Load the certificate chain and private key into a TLS acceptor
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let (chain, key) = self.load()?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| LantasError::Tls(format!("failed to build TLS config: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn load(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        debug!(
            cert = %self.cert_file.display(),
            key = %self.key_file.display(),
            "Loading TLS credential"
        );

        let mut reader = BufReader::new(open(&self.cert_file)?);
        let chain = certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                LantasError::Tls(format!(
                    "failed to parse certificate {}: {}",
                    self.cert_file.display(),
                    e
                ))
            })?;
        if chain.is_empty() {
            return Err(LantasError::Tls(format!(
                "no certificates found in {}",
                self.cert_file.display()
            )));
        }

        let mut reader = BufReader::new(open(&self.key_file)?);
        let key = private_key(&mut reader)
            .map_err(|e| {
                LantasError::Tls(format!(
                    "failed to parse private key {}: {}",
                    self.key_file.display(),
                    e
                ))
            })?
            .ok_or_else(|| {
                LantasError::Tls(format!("no private key found in {}", self.key_file.display()))
            })?;

        Ok((chain, key))
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| LantasError::Tls(format!("failed to open {}: {}", path.display(), e)))
}

/// Resolve `address` to the first socket address it names
pub async fn resolve(address: &str) -> Result<SocketAddr> {
    let resolution_error = |reason: String| LantasError::AddressResolution {
        address: address.to_string(),
        reason,
    };
    lookup_host(address)
        .await
        .map_err(|e| resolution_error(e.to_string()))?
        .next()
        .ok_or_else(|| resolution_error("no addresses found".into()))
}

/// A bound listener, plain or TLS-terminating
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
    address: String,
}

impl Listener {
    /// Resolve and bind `address`, terminating TLS with `tls` when given.
    ///
    /// `reuse_port` is accepted for configuration compatibility but not applied.
    pub async fn bind(address: &str, tls: Option<&TlsFiles>, reuse_port: bool) -> Result<Self> {
        let addr = resolve(address).await?;
        if reuse_port {
            debug!(listen = %address, "reusePort is not supported, ignoring");
        }

        // load the credential before binding so a bad one never opens a port
        let tls = tls.map(TlsFiles::acceptor).transpose()?;

        let inner = TcpListener::bind(addr).await.map_err(|e| LantasError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        info!(
            listen = %address,
            local = %inner.local_addr()?,
            tls = tls.is_some(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            tls,
            address: address.to_string(),
        })
    }

    /// Accept the next TCP connection; any TLS handshake is left to the
    /// connection task so a slow client cannot stall the accept loop.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Acceptor for the per-connection TLS handshake
    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("tls", &self.is_tls())
            .finish()
    }
}
