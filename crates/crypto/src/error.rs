//! Error types for session cipher and envelope operations.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length {0} (expected 16 or 32 bytes)")]
    InvalidKeyLength(usize),

    #[error("invalid IV length {0} (expected 16 bytes)")]
    InvalidIvLength(usize),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("pad length {pad} exceeds plaintext length {len}")]
    Padding { pad: usize, len: usize },

    #[error("invalid base64 in {field}: {reason}")]
    Encoding { field: &'static str, reason: String },

    #[error("envelope sealed under key {expected}, got key {actual}")]
    KeyMismatch { expected: String, actual: String },

    #[error("no session key available for {0}")]
    KeyUnavailable(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
