//! Where provisioned artifacts end up.
//!
//! - [`FilesystemBackend`]: certificates world-readable under `cert_dir`,
//!   private keys owner-only under `key_dir`, plus the intermediate key files
//!   of the CSR flow
//! - [`SecureElement`]: seals private keys into `{"ciphertext","iv"}` envelopes
//! - [`CertificateStore`]: platform certificate store import

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use credagent_core::config::StorageConfig;
use credagent_crypto::{decrypt, encrypt, SealedEnvelope};
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};

const KEY_EXTENSION: &str = "key";
const CERT_EXTENSION: &str = "pem";
const INTERMEDIATE_EXTENSION: &str = "intermediate";

/// Final resting place for a certificate and its private key.
pub trait StorageBackend: Send + Sync {
    fn store_private_key(&self, bytes: &[u8], id: &str, encrypted: bool) -> StorageResult<()>;

    fn store_certificate(&self, bytes: &[u8], id: &str, encrypted: bool) -> StorageResult<()>;

    /// Backend protects keys at rest itself; callers hand it plaintext.
    fn is_secure_storage(&self) -> bool {
        false
    }
}

/// Scratch storage for device-generated keys awaiting their certificate.
pub trait IntermediateKeyStore: Send + Sync {
    fn write_intermediate(&self, id: &str, document: &[u8]) -> StorageResult<()>;
    fn read_intermediate(&self, id: &str) -> StorageResult<Option<Vec<u8>>>;
    fn remove_intermediate(&self, id: &str) -> StorageResult<()>;
}

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    cert_dir: PathBuf,
    key_dir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(cert_dir: impl Into<PathBuf>, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            key_dir: key_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.cert_dir, &config.key_dir)
    }

    pub fn certificate_path(&self, id: &str) -> StorageResult<PathBuf> {
        Ok(self.cert_dir.join(format!("{}.{}", checked_id(id)?, CERT_EXTENSION)))
    }

    pub fn private_key_path(&self, id: &str) -> StorageResult<PathBuf> {
        Ok(self.key_dir.join(format!("{}.{}", checked_id(id)?, KEY_EXTENSION)))
    }

    pub fn intermediate_path(&self, id: &str) -> StorageResult<PathBuf> {
        Ok(self
            .key_dir
            .join(format!("{}.{}", checked_id(id)?, INTERMEDIATE_EXTENSION)))
    }
}

impl StorageBackend for FilesystemBackend {
    fn store_private_key(&self, bytes: &[u8], id: &str, encrypted: bool) -> StorageResult<()> {
        let path = self.private_key_path(id)?;
        create_private_dir(&self.key_dir)?;
        write_with_mode(&path, bytes, 0o600)?;
        info!(path = %path.display(), encrypted, "Private key stored");
        Ok(())
    }

    fn store_certificate(&self, bytes: &[u8], id: &str, encrypted: bool) -> StorageResult<()> {
        let path = self.certificate_path(id)?;
        fs::create_dir_all(&self.cert_dir).map_err(|e| StorageError::io(&self.cert_dir, e))?;
        write_with_mode(&path, bytes, 0o644)?;
        info!(path = %path.display(), encrypted, "Certificate stored");
        Ok(())
    }
}

impl IntermediateKeyStore for FilesystemBackend {
    fn write_intermediate(&self, id: &str, document: &[u8]) -> StorageResult<()> {
        let path = self.intermediate_path(id)?;
        create_private_dir(&self.key_dir)?;
        write_with_mode(&path, document, 0o600)?;
        debug!(path = %path.display(), "Intermediate key written");
        Ok(())
    }

    fn read_intermediate(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.intermediate_path(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn remove_intermediate(&self, id: &str) -> StorageResult<()> {
        let path = self.intermediate_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

/// Artifact ids become file names; reject anything that could escape the
/// target directory.
fn checked_id(id: &str) -> StorageResult<&str> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(id)
}

fn create_private_dir(dir: &Path) -> StorageResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| StorageError::io(dir, e))
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))
    }
}

/// Write `bytes` to a file that is created with `mode` already applied.
///
/// Pre-existing files keep their old mode on open, so it is tightened
/// afterwards as well.
fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> StorageResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path).map_err(|e| StorageError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| StorageError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(bytes).map_err(|e| StorageError::io(path, e))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))
}

/// Platform facility that seals private keys for at-rest storage.
pub trait SecureElement: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> StorageResult<SealedEnvelope>;
    fn unseal(&self, envelope: &SealedEnvelope) -> StorageResult<Vec<u8>>;
}

/// Secure element backed by an in-memory AES key.
///
/// Sealed keys do not survive a restart; for development only.
pub struct SoftwareSecureElement {
    key: Zeroizing<[u8; 32]>,
}

impl SoftwareSecureElement {
    pub fn new() -> Self {
        warn!("STATUS: SecureElement :: Hardware Sealing :: STUBBED");
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self { key }
    }
}

impl Default for SoftwareSecureElement {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureElement for SoftwareSecureElement {
    fn seal(&self, plaintext: &[u8]) -> StorageResult<SealedEnvelope> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = encrypt(plaintext, &self.key[..], &iv)
            .map_err(|e| StorageError::Sealing(e.to_string()))?;
        Ok(SealedEnvelope::new(&ciphertext, &iv))
    }

    fn unseal(&self, envelope: &SealedEnvelope) -> StorageResult<Vec<u8>> {
        let ciphertext = envelope
            .ciphertext_bytes()
            .map_err(|e| StorageError::Sealing(e.to_string()))?;
        let iv = envelope
            .iv_bytes()
            .map_err(|e| StorageError::Sealing(e.to_string()))?;
        decrypt(&ciphertext, &self.key[..], &iv).map_err(|e| StorageError::Sealing(e.to_string()))
    }
}

/// Platform certificate store.
pub trait CertificateStore: Send + Sync {
    /// Import a PEM chain, leaf first.
    fn import_chain(&self, chain: &[String], id: &str) -> StorageResult<()>;
}

/// Split concatenated PEM certificates into individual blocks.
pub fn split_pem_chain(pem: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find("-----BEGIN CERTIFICATE-----") {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        blocks.push(format!("{}\n", &rest[start..stop]));
        rest = &rest[stop..];
    }
    blocks
}
