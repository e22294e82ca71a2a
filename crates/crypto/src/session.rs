//! Session credentials and the symmetric cipher used for asset payloads.
//!
//! The authority hands out `{key_id, key, iv}` triples after a successful
//! authentication round trip. Payloads are AES-CBC (128 or 256 bit, chosen by
//! key length) with a 16-byte IV.
//!
//! # Padding
//!
//! Decryption does **not** validate PKCS#7 padding. The last plaintext byte is
//! read as a pad length and the buffer is truncated by that amount; the other
//! pad bytes are never inspected. Deployed authorities depend on this exact
//! truncation, so it must not be tightened without checking the live protocol.
//! A pad length of `0` leaves the buffer untouched; a pad length larger than
//! the buffer is rejected.

use std::fmt;

use aes::{Aes128, Aes256};
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::{
    block_padding::{NoPadding, Pkcs7},
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// AES block size and required IV length.
pub const BLOCK_SIZE: usize = 16;

/// Symmetric material obtained from one authentication round trip.
///
/// Regenerated, never mutated in place. Key and IV are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionCredential {
    key_id: String,
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl SessionCredential {
    pub fn new(key_id: impl Into<String>, key: Vec<u8>, iv: Vec<u8>) -> CryptoResult<Self> {
        check_key(&key)?;
        check_iv(&iv)?;
        Ok(Self {
            key_id: key_id.into(),
            key,
            iv,
        })
    }

    /// Build a credential from the base64 `key`/`iv` fields of a response.
    pub fn from_base64(key_id: impl Into<String>, key: &str, iv: &str) -> CryptoResult<Self> {
        Self::new(key_id, decode_b64("key", key)?, decode_b64("iv", iv)?)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        encrypt(plaintext, &self.key, &self.iv)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        decrypt(ciphertext, &self.key, &self.iv)
    }

    /// Decode a base64 field and decrypt it.
    pub fn decrypt_b64(&self, field: &'static str, value: &str) -> CryptoResult<Vec<u8>> {
        self.decrypt(&decode_b64(field, value)?)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Encrypt with PKCS#7 padding.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
    check_iv(iv)?;
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    Ok(ciphertext)
}

/// Decrypt and strip padding by trailing length byte.
pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
    check_iv(iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    let mut plaintext = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?,
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?,
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };

    strip_trailing_pad(&mut plaintext)?;
    Ok(plaintext)
}

/// Remove `buf[last]` bytes from the end of `buf`.
pub fn strip_trailing_pad(buf: &mut Vec<u8>) -> CryptoResult<()> {
    let Some(&pad) = buf.last() else {
        return Ok(());
    };
    let pad = pad as usize;
    if pad > buf.len() {
        return Err(CryptoError::Padding {
            pad,
            len: buf.len(),
        });
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

pub fn encode_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_b64(field: &'static str, value: &str) -> CryptoResult<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| CryptoError::Encoding {
            field,
            reason: e.to_string(),
        })
}

fn check_key(key: &[u8]) -> CryptoResult<()> {
    match key.len() {
        16 | 32 => Ok(()),
        n => Err(CryptoError::InvalidKeyLength(n)),
    }
}

fn check_iv(iv: &[u8]) -> CryptoResult<()> {
    if iv.len() == BLOCK_SIZE {
        Ok(())
    } else {
        Err(CryptoError::InvalidIvLength(iv.len()))
    }
}
