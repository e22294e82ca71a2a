//! Asset provisioning for the CredAgent device credential agent.
//!
//! The authority delivers asset records (issued certificates, or instructions
//! to generate a key pair and CSR). Each record is decrypted with the session
//! credential, stored through a [`StorageBackend`], and acknowledged.

pub mod asset;
pub mod csr;
pub mod error;
pub mod manager;
pub mod messenger;
pub mod processor;
pub mod status;
pub mod storage;

pub use asset::{AssetRecord, CertificateAsset, CertificateDataAsset, CsrSubject};
pub use csr::{CsrGenerator, GeneratedCsr, RcgenCsrGenerator};
pub use error::{AssetError, AssetResult, StorageError, StorageResult};
pub use manager::AssetManager;
pub use messenger::{AssetMessenger, AssetReceipt, TransportMessenger};
pub use processor::{AssetProcessor, ProvisioningContext};
pub use status::{AssetStatus, ProcessingState};
pub use storage::{
    split_pem_chain, CertificateStore, FilesystemBackend, IntermediateKeyStore, SecureElement,
    SoftwareSecureElement, StorageBackend,
};
