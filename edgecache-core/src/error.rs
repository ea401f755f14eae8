//! Error types for Edgecache

use thiserror::Error;

/// Result type for Edgecache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Edgecache
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
