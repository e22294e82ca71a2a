//! Error types for asset processing and storage.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Invalid artifact id: {0}")]
    InvalidId(String),

    #[error("Sealing failed: {0}")]
    Sealing(String),

    #[error("Certificate store import failed: {0}")]
    Import(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    #[error("Malformed asset record: {0}")]
    Malformed(String),

    #[error("Asset is missing field {0}")]
    MissingField(&'static str),

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Storing {artifact} failed: {source}")]
    StoreFailed {
        artifact: &'static str,
        source: StorageError,
    },

    #[error("Asset {0} is already being processed")]
    Duplicate(String),

    #[error("CSR generation failed: {0}")]
    Csr(String),

    #[error("Messenger error: {0}")]
    Messenger(String),
}

pub type AssetResult<T> = Result<T, AssetError>;
pub type StorageResult<T> = Result<T, StorageError>;
