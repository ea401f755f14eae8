//! Edgecache Core Library
//!
//! This crate provides the shared functionality for the Edgecache caching
//! proxy: configuration management, error handling, the logged response
//! writer, and the binary object codec used for cache persistence.

pub mod codec;
pub mod config;
pub mod error;
pub mod response;

pub use error::{Error, Result};

/// Edgecache version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
