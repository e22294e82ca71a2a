//! Core error types

use thiserror::Error;

/// Core error type for the credential agent
#[derive(Debug, Error)]
pub enum CoreError {
    /// Generic error
    #[error("Core error: {0}")]
    Generic(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging could not be initialised (usually a second init in one process)
    #[error("Logging init failed: {0}")]
    Logging(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Crate-level error alias.
pub type Error = CoreError;
