//! Per-asset-type processing.
//!
//! # Certificate flow
//!
//! ```text
//! decrypt certificate
//!     ↓
//! private key: server-sent (decrypt) | intermediate file (reopen) | none
//!     ↓
//! store certificate ──→ certificate_stored / certificate_failure
//! store private key ──→ private_key_stored / private_key_failure
//!     ↓
//! acknowledge receipt
//! ```
//!
//! The two artifacts succeed or fail independently; nothing is rolled back.
//!
//! # Certificate-data flow
//!
//! Generate key pair and CSR, seal the key into the intermediate file, submit
//! the CSR, then wait until the signed certificate arrives as a `certificate`
//! record for the same asset id and run the certificate flow.

use std::sync::Arc;

use credagent_core::EventSink;
use credagent_crypto::{KeyEnvelope, KeyResolver, SessionCredential};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::asset::{AssetRecord, CertificateAsset, CertificateDataAsset, CERTIFICATE, CERTIFICATE_DATA};
use crate::csr::{CsrGenerator, RcgenCsrGenerator};
use crate::error::{AssetError, AssetResult, StorageError};
use crate::messenger::{AssetMessenger, AssetReceipt};
use crate::status::{AssetStatus, ProcessingState};
use crate::storage::{
    split_pem_chain, CertificateStore, FilesystemBackend, IntermediateKeyStore, SecureElement,
    StorageBackend,
};

/// Collaborators shared by every processor.
#[derive(Clone)]
pub struct ProvisioningContext {
    pub storage: Arc<dyn StorageBackend>,
    pub intermediate: Arc<dyn IntermediateKeyStore>,
    pub secure_element: Option<Arc<dyn SecureElement>>,
    pub certificate_store: Option<Arc<dyn CertificateStore>>,
    pub csr_generator: Arc<dyn CsrGenerator>,
    /// Reopens intermediate keys sealed under an earlier credential
    pub resolver: Option<Arc<dyn KeyResolver>>,
    pub messenger: Arc<dyn AssetMessenger>,
    pub events: Arc<dyn EventSink>,
    /// Write key envelopes as base64 of the whole JSON document
    pub base64_envelope: bool,
}

impl ProvisioningContext {
    pub fn new(
        filesystem: Arc<FilesystemBackend>,
        messenger: Arc<dyn AssetMessenger>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            storage: filesystem.clone(),
            intermediate: filesystem,
            secure_element: None,
            certificate_store: None,
            csr_generator: Arc::new(RcgenCsrGenerator),
            resolver: None,
            messenger,
            events,
            base64_envelope: false,
        }
    }

    /// Replace the final storage, e.g. with a secure-storage provider.
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_secure_element(mut self, element: Arc<dyn SecureElement>) -> Self {
        self.secure_element = Some(element);
        self
    }

    pub fn with_certificate_store(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.certificate_store = Some(store);
        self
    }

    pub fn with_csr_generator(mut self, generator: Arc<dyn CsrGenerator>) -> Self {
        self.csr_generator = generator;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_base64_envelope(mut self, enabled: bool) -> Self {
        self.base64_envelope = enabled;
        self
    }
}

pub enum AssetProcessor {
    Certificate(CertificateProcessor),
    CertificateData(CertificateDataProcessor),
}

impl AssetProcessor {
    pub fn for_record(record: &AssetRecord) -> Self {
        match record {
            AssetRecord::Certificate(asset) => {
                AssetProcessor::Certificate(CertificateProcessor::new(&asset.asset_id))
            }
            AssetRecord::CertificateData(asset) => {
                AssetProcessor::CertificateData(CertificateDataProcessor::new(&asset.asset_id))
            }
        }
    }

    pub fn asset_id(&self) -> &str {
        match self {
            AssetProcessor::Certificate(p) => &p.asset_id,
            AssetProcessor::CertificateData(p) => &p.asset_id,
        }
    }

    pub fn state(&self) -> &ProcessingState {
        match self {
            AssetProcessor::Certificate(p) => &p.state,
            AssetProcessor::CertificateData(p) => &p.state,
        }
    }

    pub fn handle_asset(
        &mut self,
        record: AssetRecord,
        credential: &SessionCredential,
        ctx: &ProvisioningContext,
    ) {
        match (self, record) {
            (AssetProcessor::Certificate(p), AssetRecord::Certificate(asset)) => {
                p.handle(&asset, credential, ctx)
            }
            (AssetProcessor::CertificateData(p), AssetRecord::CertificateData(asset)) => {
                p.handle(asset, credential, ctx)
            }
            (processor, record) => {
                let message = format!(
                    "{} record routed to the wrong processor",
                    record.asset_type()
                );
                error!(asset_id = %record.asset_id(), %message);
                processor.fail(message);
            }
        }
    }

    /// Periodic tick. Returns whether the processor is complete.
    pub fn on_update(&mut self) -> bool {
        if let AssetProcessor::CertificateData(p) = self {
            if p.waiting {
                debug!(asset_id = %p.asset_id, "Still waiting for signed certificate");
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn waiting_for_certificate(&self) -> bool {
        match self {
            AssetProcessor::Certificate(_) => false,
            AssetProcessor::CertificateData(p) => p.waiting,
        }
    }

    /// Deliver the signed certificate for a pending CSR.
    pub fn certificate_received(
        &mut self,
        asset: &CertificateAsset,
        credential: &SessionCredential,
        ctx: &ProvisioningContext,
    ) {
        match self {
            AssetProcessor::CertificateData(p) if p.waiting => p.complete(asset, credential, ctx),
            processor => {
                warn!(asset_id = %asset.asset_id, "Unexpected certificate delivery");
                processor.fail("processor is not waiting for a certificate");
            }
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        match self {
            AssetProcessor::Certificate(p) => p.state.fail(message),
            AssetProcessor::CertificateData(p) => {
                p.waiting = false;
                p.state.fail(message)
            }
        }
    }
}

pub struct CertificateProcessor {
    asset_id: String,
    state: ProcessingState,
}

impl CertificateProcessor {
    pub fn new(asset_id: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            state: ProcessingState::in_progress(),
        }
    }

    fn handle(&mut self, asset: &CertificateAsset, credential: &SessionCredential, ctx: &ProvisioningContext) {
        self.state = run_certificate_flow(asset, asset.store_encrypted, credential, ctx);
        acknowledge(ctx, &self.asset_id, CERTIFICATE, &self.state);
    }
}

pub struct CertificateDataProcessor {
    asset_id: String,
    instructions: Option<CertificateDataAsset>,
    waiting: bool,
    state: ProcessingState,
}

impl CertificateDataProcessor {
    pub fn new(asset_id: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            instructions: None,
            waiting: false,
            state: ProcessingState::in_progress(),
        }
    }

    fn handle(
        &mut self,
        instructions: CertificateDataAsset,
        credential: &SessionCredential,
        ctx: &ProvisioningContext,
    ) {
        match self.request_certificate(&instructions, credential, ctx) {
            Ok(()) => {
                info!(asset_id = %self.asset_id, "CSR submitted, waiting for certificate");
                self.instructions = Some(instructions);
                self.waiting = true;
            }
            Err(err) => {
                error!(asset_id = %self.asset_id, error = %err, "CSR flow failed");
                // Leave no orphaned key behind
                if let Err(e) = ctx.intermediate.remove_intermediate(&self.asset_id) {
                    warn!(asset_id = %self.asset_id, error = %e, "Could not remove intermediate key");
                }
                self.state.fail(err.to_string());
                acknowledge(ctx, &self.asset_id, CERTIFICATE_DATA, &self.state);
            }
        }
    }

    fn request_certificate(
        &self,
        instructions: &CertificateDataAsset,
        credential: &SessionCredential,
        ctx: &ProvisioningContext,
    ) -> AssetResult<()> {
        let generated = ctx.csr_generator.generate(instructions)?;

        let envelope = KeyEnvelope::seal(
            generated.private_key_pem.as_bytes(),
            credential,
            &self.asset_id,
            false,
        )
        .map_err(|e| AssetError::DecryptFailed(e.to_string()))?;
        let document = envelope
            .to_document(ctx.base64_envelope)
            .map_err(|e| AssetError::DecryptFailed(e.to_string()))?;
        ctx.intermediate
            .write_intermediate(&self.asset_id, document.as_bytes())
            .map_err(|source| AssetError::StoreFailed {
                artifact: "intermediate key",
                source,
            })?;

        ctx.messenger.submit_csr(&self.asset_id, &generated.csr_pem)
    }

    fn complete(&mut self, asset: &CertificateAsset, credential: &SessionCredential, ctx: &ProvisioningContext) {
        self.waiting = false;
        let store_encrypted = asset.store_encrypted
            || self.instructions.as_ref().is_some_and(|i| i.store_encrypted);
        self.state = run_certificate_flow(asset, store_encrypted, credential, ctx);
        acknowledge(ctx, &self.asset_id, CERTIFICATE_DATA, &self.state);
    }
}

/// Where the private key for a certificate comes from.
enum KeySource {
    Delivered(Zeroizing<Vec<u8>>),
    Intermediate(Zeroizing<Vec<u8>>),
    Absent,
}

fn run_certificate_flow(
    asset: &CertificateAsset,
    store_encrypted: bool,
    credential: &SessionCredential,
    ctx: &ProvisioningContext,
) -> ProcessingState {
    let id = asset.asset_id.as_str();
    let mut state = ProcessingState::in_progress();
    ctx.events.notify_certificate_received(id);

    let certificate = match credential.decrypt_b64("certificate", &asset.certificate) {
        Ok(pem) => Zeroizing::new(pem),
        Err(e) => {
            let err = AssetError::DecryptFailed(format!("certificate: {}", e));
            ctx.events.notify_certificate_failure(id, &err.to_string());
            state.fail(err.to_string());
            return state;
        }
    };

    let key = match load_private_key(asset, credential, ctx) {
        Ok(key) => key,
        Err(err) => {
            ctx.events.notify_private_key_failure(id, &err.to_string());
            state.fail(err.to_string());
            return state;
        }
    };

    match store_certificate(&certificate, &asset.file_name, ctx) {
        Ok(()) => {
            state.certificate_stored = true;
            ctx.events.notify_certificate_stored(id);
        }
        Err(err) => {
            ctx.events.notify_certificate_failure(id, &err.to_string());
            state.fail(err.to_string());
        }
    }

    let (plaintext, from_intermediate) = match &key {
        KeySource::Delivered(k) => (Some(k), false),
        KeySource::Intermediate(k) => (Some(k), true),
        KeySource::Absent => (None, false),
    };
    if let Some(plaintext) = plaintext {
        match store_private_key(plaintext, asset, store_encrypted, credential, ctx) {
            Ok(()) => {
                state.private_key_stored = Some(true);
                ctx.events.notify_private_key_stored(id);
                if from_intermediate {
                    if let Err(e) = ctx.intermediate.remove_intermediate(id) {
                        warn!(asset_id = id, error = %e, "Could not remove intermediate key");
                    }
                }
            }
            Err(err) => {
                state.private_key_stored = Some(false);
                ctx.events.notify_private_key_failure(id, &err.to_string());
                state.fail(err.to_string());
            }
        }
    }

    state.finish();
    info!(asset_id = id, status = ?state.status, "Certificate asset processed");
    state
}

fn load_private_key(
    asset: &CertificateAsset,
    credential: &SessionCredential,
    ctx: &ProvisioningContext,
) -> AssetResult<KeySource> {
    let id = asset.asset_id.as_str();

    if let Some(encrypted) = &asset.private_key {
        ctx.events.notify_private_key_received(id);
        let plaintext = credential
            .decrypt_b64("privateKey", encrypted)
            .map_err(|e| AssetError::DecryptFailed(format!("private key: {}", e)))?;
        return Ok(KeySource::Delivered(Zeroizing::new(plaintext)));
    }

    let document = ctx
        .intermediate
        .read_intermediate(id)
        .map_err(|source| AssetError::StoreFailed {
            artifact: "intermediate key",
            source,
        })?;
    let Some(document) = document else {
        return Ok(KeySource::Absent);
    };

    let text = String::from_utf8(document)
        .map_err(|e| AssetError::DecryptFailed(format!("intermediate key: {}", e)))?;
    let envelope = KeyEnvelope::from_document(&text)
        .map_err(|e| AssetError::DecryptFailed(format!("intermediate key: {}", e)))?;

    let opened = if envelope.key_id == credential.key_id() {
        envelope.open(credential)
    } else {
        let resolver = ctx.resolver.as_ref().ok_or_else(|| {
            AssetError::DecryptFailed(format!(
                "intermediate key sealed under {} and no resolver configured",
                envelope.key_id
            ))
        })?;
        resolver
            .resolve(&envelope.key_id)
            .and_then(|sealing| envelope.open(&sealing))
    };
    let plaintext =
        opened.map_err(|e| AssetError::DecryptFailed(format!("intermediate key: {}", e)))?;

    Ok(KeySource::Intermediate(Zeroizing::new(plaintext)))
}

fn store_certificate(pem: &[u8], file_name: &str, ctx: &ProvisioningContext) -> AssetResult<()> {
    let stored = match (&ctx.certificate_store, ctx.storage.is_secure_storage()) {
        (Some(store), false) => {
            let text = std::str::from_utf8(pem)
                .map_err(|e| AssetError::DecryptFailed(format!("certificate is not PEM: {}", e)))?;
            let chain = split_pem_chain(text);
            if chain.is_empty() {
                return Err(AssetError::DecryptFailed(
                    "certificate contains no PEM blocks".to_string(),
                ));
            }
            store.import_chain(&chain, file_name)
        }
        _ => ctx.storage.store_certificate(pem, file_name, false),
    };
    stored.map_err(|source| AssetError::StoreFailed {
        artifact: "certificate",
        source,
    })
}

fn store_private_key(
    plaintext: &[u8],
    asset: &CertificateAsset,
    store_encrypted: bool,
    credential: &SessionCredential,
    ctx: &ProvisioningContext,
) -> AssetResult<()> {
    let failed = |source: StorageError| AssetError::StoreFailed {
        artifact: "private key",
        source,
    };

    if ctx.storage.is_secure_storage() || !store_encrypted {
        return ctx
            .storage
            .store_private_key(plaintext, &asset.file_name, false)
            .map_err(failed);
    }

    let at_rest = match &ctx.secure_element {
        Some(element) => {
            let sealed = element.seal(plaintext).map_err(failed)?;
            sealed
                .to_json()
                .map_err(|e| AssetError::DecryptFailed(e.to_string()))?
        }
        None => KeyEnvelope::seal(plaintext, credential, &asset.asset_id, asset.sign_apphash)
            .and_then(|envelope| envelope.to_document(ctx.base64_envelope))
            .map_err(|e| AssetError::DecryptFailed(e.to_string()))?,
    };
    ctx.storage
        .store_private_key(at_rest.as_bytes(), &asset.file_name, true)
        .map_err(failed)
}

fn acknowledge(ctx: &ProvisioningContext, asset_id: &str, asset_type: &str, state: &ProcessingState) {
    let receipt = AssetReceipt::from_state(asset_id, asset_type, state);
    let result = receipt
        .to_json()
        .and_then(|json| ctx.messenger.acknowledge(&json, state.error_message.as_deref()));
    if let Err(err) = result {
        warn!(asset_id, error = %err, "Acknowledgement not delivered");
    } else if state.status == AssetStatus::Failure {
        debug!(asset_id, "Failure acknowledged");
    }
}
