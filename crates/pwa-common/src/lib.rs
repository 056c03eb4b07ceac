//! # PWA Common
//!
//! Common utilities, error types, and logging configuration for the PWA
//! offline cache controller.
//!
//! ## Features
//!
//! - Unified error type for configuration, I/O and timeouts
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - JSON config file loading

use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod logging;
pub mod retry;

pub use config::{load_json, save_json};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type shared by the controller crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, Error>;
