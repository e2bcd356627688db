//! Runtime configuration snapshot
//!
//! The proxy is configured from a single YAML file holding named upstreams,
//! named middleware chains and the servers that tie them together. Logging
//! settings may additionally be overridden from the environment.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{LantasError, Result};

/// Config files at or above this size are rejected before parsing (10 MiB)
pub const MAX_CONFIG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Option key recognized by compression steps
pub const COMPRESSION_LEVEL_KEY: &str = "compressionLevel";

/// Complete configuration loaded from disk
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Runtime {
    /// Named upstreams servers can proxy to
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
    /// Named middleware chains servers can reference
    #[serde(default)]
    pub middleware_chains: BTreeMap<String, MiddlewareChainConfig>,
    /// Listener sets
    #[serde(default)]
    pub servers: Option<Vec<ServerConfig>>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream addresses (exactly one is supported)
    #[serde(default)]
    pub servers: Vec<String>,
    /// Maximum idle connections kept for reuse (0 disables pooling)
    #[serde(default)]
    pub keepalive: usize,
    /// Whether the upstream expects TLS
    #[serde(default)]
    pub tls: bool,
}

impl UpstreamConfig {
    /// The single address this upstream dials
    pub fn address(&self) -> Option<&str> {
        self.servers.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiddlewareChainConfig {
    #[serde(default)]
    pub steps: Vec<MiddlewareStep>,
}

/// One step of a middleware chain; exactly one field must be set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiddlewareStep {
    pub compression: Option<CodecStep>,
    pub decompression: Option<CodecStep>,
}

/// Settings shared by compression and decompression steps
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodecStep {
    pub algorithm: String,
    /// Free-form per-algorithm options
    #[serde(default)]
    pub config: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<ListenConfig>,
    pub tls: Option<ServerTlsConfig>,
    /// Upstream names; only the first one is used
    #[serde(default)]
    pub upstreams: Vec<String>,
    pub middlewares: Option<ServerMiddlewares>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Accepted but not applied to the socket
    #[serde(default, rename = "reusePort")]
    pub reuse_port: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTlsConfig {
    #[serde(default, rename = "certFile")]
    pub cert_file: String,
    #[serde(default, rename = "keyFile")]
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMiddlewares {
    pub upstream: Option<UpstreamMiddlewares>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamMiddlewares {
    /// Chains applied to client bytes before they are written upstream
    #[serde(default)]
    pub prewrite: Vec<MiddlewareRef>,
    /// Chains applied to upstream bytes after they are read
    #[serde(default)]
    pub postread: Vec<MiddlewareRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MiddlewareRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LogConfig {
    /// Apply `LOG_LEVEL` / `LOG_FORMAT` from the environment on top of the file values
    pub fn with_env_overrides(mut self) -> Self {
        self.level = get_env_or("LOG_LEVEL", &self.level);
        self.format = get_env_or("LOG_FORMAT", &self.format);
        self
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl ServerConfig {
    /// Name of the upstream this server proxies to
    pub fn upstream(&self) -> Option<&str> {
        self.upstreams.first().map(String::as_str)
    }

    pub fn listen_addresses(&self) -> &[String] {
        self.listen
            .as_ref()
            .map(|l| l.addresses.as_slice())
            .unwrap_or_default()
    }

    pub fn reuse_port(&self) -> bool {
        self.listen.as_ref().is_some_and(|l| l.reuse_port)
    }

    /// Chain names for the client -> upstream direction, in order
    pub fn prewrite_chains(&self) -> Vec<&str> {
        self.upstream_middlewares()
            .map(|m| m.prewrite.iter().map(|r| r.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Chain names for the upstream -> client direction, in order
    pub fn postread_chains(&self) -> Vec<&str> {
        self.upstream_middlewares()
            .map(|m| m.postread.iter().map(|r| r.name.as_str()).collect())
            .unwrap_or_default()
    }

    fn upstream_middlewares(&self) -> Option<&UpstreamMiddlewares> {
        self.middlewares.as_ref().and_then(|m| m.upstream.as_ref())
    }
}

impl Runtime {
    /// Read, parse and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let meta = fs::metadata(path).map_err(|e| LantasError::ConfigRead {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        if !meta.is_file() {
            return Err(LantasError::ConfigRead {
                path: display,
                reason: "not a regular file".into(),
            });
        }
        if meta.len() >= MAX_CONFIG_FILE_SIZE {
            return Err(LantasError::ConfigRead {
                path: display,
                reason: format!("file is larger than {} bytes", MAX_CONFIG_FILE_SIZE),
            });
        }

        let raw = fs::read_to_string(path).map_err(|e| LantasError::ConfigRead {
            path: display,
            reason: e.to_string(),
        })?;

        let runtime = Self::parse(&raw)?;
        runtime.validate()?;
        Ok(runtime)
    }

    /// Parse YAML without validating it
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Check every cross-reference the proxy relies on
    pub fn validate(&self) -> Result<()> {
        for (name, upstream) in &self.upstreams {
            match upstream.servers.len() {
                0 => {
                    return Err(invalid(format!(
                        "'servers' field in upstreams[{}] must list one server",
                        name
                    )))
                }
                1 => {}
                _ => {
                    return Err(invalid(format!(
                        "'servers' field in upstreams[{}] can only accept one server",
                        name
                    )))
                }
            }
        }

        for (name, chain) in &self.middleware_chains {
            for (i, step) in chain.steps.iter().enumerate() {
                if step.compression.is_some() == step.decompression.is_some() {
                    return Err(invalid(format!(
                        "middleware_chains[{}].steps[{}] must set exactly one of 'compression' or 'decompression'",
                        name, i
                    )));
                }
            }
        }

        let servers = self
            .servers
            .as_ref()
            .ok_or_else(|| invalid("'servers' field is required".into()))?;

        for (i, server) in servers.iter().enumerate() {
            if server.listen.is_none() {
                return Err(invalid(format!(
                    "'listen' field in servers[{}] is not defined. Server must listen to at least one address.",
                    i
                )));
            }
            if server.listen_addresses().is_empty() {
                return Err(invalid(format!(
                    "'listen.addresses' field in servers[{}] is empty. Server must listen to at least one address.",
                    i
                )));
            }

            let upstream = server.upstream().ok_or_else(|| {
                invalid(format!(
                    "'upstreams' field in servers[{}] must have at least one upstream.",
                    i
                ))
            })?;
            if !self.upstreams.contains_key(upstream) {
                return Err(invalid(format!(
                    "specified upstream {} in servers[{}] does not exist in the global upstreams list.",
                    upstream, i
                )));
            }

            for chain in server
                .prewrite_chains()
                .into_iter()
                .chain(server.postread_chains())
            {
                if !self.middleware_chains.contains_key(chain) {
                    return Err(invalid(format!(
                        "middleware chain {} referenced in servers[{}] does not exist in middleware_chains.",
                        chain, i
                    )));
                }
            }
        }

        Ok(())
    }

    /// Servers declared in the file (empty when validation has not run)
    pub fn servers(&self) -> &[ServerConfig] {
        self.servers.as_deref().unwrap_or_default()
    }
}

/// Resolve a possibly relative path against the configured root directory
pub fn resolve_path(root_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_dir.join(path)
    }
}

fn invalid(msg: String) -> LantasError {
    LantasError::InvalidConfig(msg)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
