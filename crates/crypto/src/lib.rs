//! Session-credential cryptography for the CredAgent device credential agent.
//!
//! - [`SessionCredential`]: the `{key_id, key, iv}` triple and its cipher
//! - [`app_hash`]: HMAC signing of application hashes
//! - [`envelope`]: at-rest key envelopes
//! - [`KeyResolver`]: lookup of a credential by key id

pub mod app_hash;
pub mod envelope;
pub mod error;
pub mod session;

pub use app_hash::{sign_app_hash, verify_app_hash};
pub use envelope::{KeyEnvelope, SealedEnvelope};
pub use error::{CryptoError, CryptoResult};
pub use session::{decode_b64, decrypt, encode_b64, encrypt, strip_trailing_pad, SessionCredential};

/// Resolves a session credential by key id.
///
/// Used to reopen key envelopes sealed during an earlier session.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, key_id: &str) -> CryptoResult<SessionCredential>;
}
