//! Device identity capability.
//!
//! An [`IdentityProvider`] turns an optional server challenge plus role and
//! metadata into a device key: a JSON document proving the device holds its
//! identity key. Hardware and vendor providers live outside this workspace;
//! the [`SoftwareIdentityProvider`] keeps an in-memory P-256 key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use credagent_core::config::{IdentityConfig, ProviderKind};
use p256::ecdsa::{signature::Signer as _, Signature, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Opaque device key document. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceKey(Vec<u8>);

impl DeviceKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse the document for embedding in a request body.
    pub fn to_value(&self) -> Result<serde_json::Value, ProviderError> {
        serde_json::from_slice(&self.0).map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Role and metadata bound into a device key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyParams {
    pub role: String,
    pub metadata: BTreeMap<String, String>,
    /// Key-rotation metadata from an edge authority, signed with the challenge.
    pub rotation_metadata: Option<serde_json::Value>,
}

impl KeyParams {
    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            role: config.role.clone(),
            metadata: config.metadata.clone(),
            rotation_metadata: None,
        }
    }
}

/// Capability that proves device identity.
///
/// Implementations must be callable from several threads at once.
pub trait IdentityProvider: Send + Sync {
    fn init(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn get_device_key(
        &self,
        challenge: Option<&str>,
        params: &KeyParams,
    ) -> Result<DeviceKey, ProviderError>;

    fn device_tid(&self) -> Result<String, ProviderError>;
}

/// Build the provider named in configuration.
pub fn provider_from_config(config: &IdentityConfig) -> Arc<dyn IdentityProvider> {
    match config.provider {
        ProviderKind::Software => Arc::new(SoftwareIdentityProvider::generate(
            config.device_tid.clone(),
        )),
    }
}

/// Device key document produced by [`SoftwareIdentityProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareDeviceKey {
    pub device_tid: String,
    /// Compressed SEC1 public key, hex
    pub public_key: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<serde_json::Value>,
    /// DER ECDSA signature over the challenge and rotation metadata, hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl SoftwareDeviceKey {
    /// Bytes covered by `signature`.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.device_tid.as_bytes());
        hasher.update(self.challenge.as_deref().unwrap_or_default().as_bytes());
        if let Some(rotation) = &self.rotation {
            hasher.update(rotation.to_string().as_bytes());
        }
        hasher.finalize().to_vec()
    }
}

/// In-memory P-256 identity for development and tests.
pub struct SoftwareIdentityProvider {
    signing_key: SigningKey,
    device_tid: String,
    running: AtomicBool,
}

impl SoftwareIdentityProvider {
    /// Generate a fresh identity key. The device tid defaults to a digest of
    /// the public key.
    pub fn generate(device_tid: Option<String>) -> Self {
        warn!("STATUS: IdentityProvider :: Hardware Identity :: STUBBED (software key)");
        let signing_key = SigningKey::random(&mut OsRng);
        let device_tid = device_tid.unwrap_or_else(|| {
            let public = signing_key.verifying_key().to_encoded_point(true);
            hex::encode(&blake3::hash(public.as_bytes()).as_bytes()[..8])
        });
        Self {
            signing_key,
            device_tid,
            running: AtomicBool::new(true),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_encoded_point(true).as_bytes())
    }
}

impl IdentityProvider for SoftwareIdentityProvider {
    fn init(&self) -> Result<(), ProviderError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn get_device_key(
        &self,
        challenge: Option<&str>,
        params: &KeyParams,
    ) -> Result<DeviceKey, ProviderError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("provider is shut down".to_string()));
        }

        let mut document = SoftwareDeviceKey {
            device_tid: self.device_tid.clone(),
            public_key: self.public_key_hex(),
            role: params.role.clone(),
            metadata: params.metadata.clone(),
            challenge: challenge.map(str::to_string),
            rotation: params.rotation_metadata.clone(),
            signature: None,
        };
        if challenge.is_some() {
            let signature: Signature = self.signing_key.sign(&document.signed_payload());
            document.signature = Some(hex::encode(signature.to_der().as_bytes()));
        }
        debug!(bound = challenge.is_some(), "Device key generated");

        serde_json::to_vec(&document)
            .map(DeviceKey::new)
            .map_err(|e| ProviderError::KeyGeneration(e.to_string()))
    }

    fn device_tid(&self) -> Result<String, ProviderError> {
        Ok(self.device_tid.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Verifier, VerifyingKey};

    fn params() -> KeyParams {
        KeyParams {
            role: "device".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unbound_key_has_no_signature() {
        let provider = SoftwareIdentityProvider::generate(Some("tid-1".to_string()));
        let key = provider.get_device_key(None, &params()).unwrap();
        let doc: SoftwareDeviceKey = serde_json::from_slice(key.as_bytes()).unwrap();
        assert_eq!(doc.device_tid, "tid-1");
        assert!(doc.challenge.is_none());
        assert!(doc.signature.is_none());
    }

    #[test]
    fn test_bound_key_signature_verifies() {
        let provider = SoftwareIdentityProvider::generate(None);
        let mut p = params();
        p.rotation_metadata = Some(serde_json::json!({"epoch": 4}));
        let key = provider.get_device_key(Some("nonce-1"), &p).unwrap();
        let doc: SoftwareDeviceKey = serde_json::from_slice(key.as_bytes()).unwrap();

        let public = hex::decode(&doc.public_key).unwrap();
        let verifying = VerifyingKey::from_sec1_bytes(&public).unwrap();
        let der = hex::decode(doc.signature.as_ref().unwrap()).unwrap();
        let signature = Signature::from_der(&der).unwrap();
        assert!(verifying.verify(&doc.signed_payload(), &signature).is_ok());
        assert_eq!(doc.rotation, Some(serde_json::json!({"epoch": 4})));
    }

    #[test]
    fn test_shutdown_makes_provider_unavailable() {
        let provider = SoftwareIdentityProvider::generate(None);
        provider.shutdown();
        assert!(matches!(
            provider.get_device_key(None, &params()),
            Err(ProviderError::Unavailable(_))
        ));
        provider.init().unwrap();
        assert!(provider.get_device_key(None, &params()).is_ok());
    }

    #[test]
    fn test_device_key_debug_is_redacted() {
        let key = DeviceKey::new(b"{\"secret\":1}".to_vec());
        assert!(!format!("{:?}", key).contains("secret"));
    }
}
