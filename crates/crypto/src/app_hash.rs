//! HMAC-SHA256 signing of the application hash sent with key requests.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::session::{decode_b64, encode_b64};

type HmacSha256 = Hmac<Sha256>;

/// Sign `app_hash` with a session key, returning the base64 MAC.
pub fn sign_app_hash(app_hash: &str, key: &[u8]) -> CryptoResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    mac.update(app_hash.as_bytes());
    Ok(encode_b64(&mac.finalize().into_bytes()))
}

/// Constant-time check of a base64 MAC produced by [`sign_app_hash`].
pub fn verify_app_hash(app_hash: &str, key: &[u8], signature: &str) -> CryptoResult<bool> {
    let expected = decode_b64("signature", signature)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    mac.update(app_hash.as_bytes());
    Ok(mac.verify_slice(&expected).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = [3u8; 32];
        let sig = sign_app_hash("sha256:abcdef", &key).unwrap();
        assert!(verify_app_hash("sha256:abcdef", &key, &sig).unwrap());
        assert!(!verify_app_hash("sha256:abcdeg", &key, &sig).unwrap());
        assert!(!verify_app_hash("sha256:abcdef", &[4u8; 32], &sig).unwrap());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let key = [1u8; 16];
        assert_eq!(
            sign_app_hash("hash", &key).unwrap(),
            sign_app_hash("hash", &key).unwrap()
        );
    }
}
