use std::time::Duration;

use thiserror::Error;

/// Unified error type for Lantas
#[derive(Error, Debug)]
pub enum LantasError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config file {path}: {reason}")]
    ConfigRead { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Unknown upstream: {0}")]
    UnknownUpstream(String),

    #[error("Unknown middleware chain: {0}")]
    UnknownMiddlewareChain(String),

    #[error("Invalid {kind} algorithm {algorithm:?}")]
    UnknownAlgorithm { kind: &'static str, algorithm: String },

    #[error("Invalid middleware option {key}: {reason}")]
    InvalidMiddlewareOption { key: String, reason: String },

    // Listener errors
    #[error("Failed to resolve listen address {address}: {reason}")]
    AddressResolution { address: String, reason: String },

    #[error("Failed to bind listener on {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    // Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Failed to dial upstream {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Failed to close connection: {0}")]
    Close(String),

    // Pipeline errors
    #[error("Buffer chain exhausted at stage {stage} of {len}")]
    BufferChainExhausted { stage: usize, len: usize },

    #[error("Middleware pipeline failed: {0}")]
    Pipeline(String),

    #[error("{algorithm} codec error: {reason}")]
    Codec {
        algorithm: &'static str,
        reason: String,
    },

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Lantas operations
pub type Result<T> = std::result::Result<T, LantasError>;

/// The smallest unit a failure takes down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Abort initialization, nothing is served
    Startup,
    /// Ends the affected direction or connection only
    Connection,
    /// Returned to the caller of a pool operation
    Pool,
}

impl LantasError {
    /// Classify this error by the unit it terminates
    pub fn scope(&self) -> ErrorScope {
        match self {
            LantasError::InvalidConfig(_)
            | LantasError::ConfigRead { .. }
            | LantasError::ConfigParse(_)
            | LantasError::UnknownUpstream(_)
            | LantasError::UnknownMiddlewareChain(_)
            | LantasError::UnknownAlgorithm { .. }
            | LantasError::InvalidMiddlewareOption { .. }
            | LantasError::AddressResolution { .. }
            | LantasError::Bind { .. }
            | LantasError::Tls(_) => ErrorScope::Startup,

            LantasError::Pool(_) | LantasError::Dial { .. } | LantasError::Close(_) => {
                ErrorScope::Pool
            }

            LantasError::BufferChainExhausted { .. }
            | LantasError::Pipeline(_)
            | LantasError::Codec { .. }
            | LantasError::WriteTimeout(_)
            | LantasError::Io(_)
            | LantasError::Internal(_) => ErrorScope::Connection,
        }
    }

    /// Check if this error must abort startup
    pub fn is_startup_fatal(&self) -> bool {
        self.scope() == ErrorScope::Startup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_scope_mapping() {
        assert_eq!(
            LantasError::UnknownUpstream("origin".to_string()).scope(),
            ErrorScope::Startup
        );
        assert_eq!(
            LantasError::UnknownAlgorithm {
                kind: "compression",
                algorithm: "brotli".to_string()
            }
            .scope(),
            ErrorScope::Startup
        );
        assert_eq!(
            LantasError::Dial {
                address: "127.0.0.1:1".to_string(),
                reason: "refused".to_string()
            }
            .scope(),
            ErrorScope::Pool
        );
        assert_eq!(
            LantasError::Codec {
                algorithm: "gzip",
                reason: "invalid gzip header".to_string()
            }
            .scope(),
            ErrorScope::Connection
        );
        assert_eq!(
            LantasError::WriteTimeout(Duration::from_secs(30)).scope(),
            ErrorScope::Connection
        );
    }

    #[test]
    fn test_startup_fatal_helper() {
        assert!(LantasError::Tls("no key".to_string()).is_startup_fatal());
        assert!(!LantasError::Pipeline("boom".to_string()).is_startup_fatal());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = LantasError::UnknownAlgorithm {
            kind: "decompression",
            algorithm: "zstd".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid decompression algorithm \"zstd\"");

        let err = LantasError::BufferChainExhausted { stage: 3, len: 3 };
        assert_eq!(err.to_string(), "Buffer chain exhausted at stage 3 of 3");
    }
}
