//! Error types for identity providers and the authentication protocol.

use credagent_core::TransportError;
use credagent_crypto::CryptoError;
use thiserror::Error;

/// Errors raised by an [`IdentityProvider`](crate::IdentityProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Provider not initialised or backing hardware missing
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),

    /// Device key could not be produced
    #[error("Device key generation failed: {0}")]
    KeyGeneration(String),

    /// Device key is not a JSON document
    #[error("Malformed device key: {0}")]
    Malformed(String),
}

/// Errors from one authentication or key-by-id round trip.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unparsable response or missing expected field
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Identity error: {0}")]
    Identity(#[from] ProviderError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Challenge failed (status {status_code:?}): {message}")]
    ChallengeFailed {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Registration denied (status {status_code:?}): {message}")]
    RegistrationDenied {
        message: String,
        status_code: Option<u16>,
    },

    /// Authority asked for registration again after a successful one
    #[error("Registration requested again after the device was registered")]
    RegistrationLoop,

    #[error("Not authorized (status {status_code:?}): {message}")]
    NotAuthorized {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Protocol(err.to_string())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
