//! Routes asset records to processors and tracks them until completion.

use std::collections::BTreeMap;

use credagent_crypto::SessionCredential;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::asset::AssetRecord;
use crate::error::AssetError;
use crate::processor::{AssetProcessor, ProvisioningContext};
use crate::status::ProcessingState;

/// Owns one processor per in-flight asset id.
pub struct AssetManager {
    ctx: ProvisioningContext,
    processors: Mutex<BTreeMap<String, AssetProcessor>>,
}

impl AssetManager {
    pub fn new(ctx: ProvisioningContext) -> Self {
        Self {
            ctx,
            processors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &ProvisioningContext {
        &self.ctx
    }

    /// Process one record under the given session credential.
    ///
    /// A record whose asset id is already in flight is rejected, unless it is
    /// the certificate a pending CSR is waiting for.
    ///
    /// The processor map stays locked for the whole handler, including the
    /// acknowledgement, CSR submission and key resolver requests. Records are
    /// therefore handled one at a time, and concurrent calls to [`update`] or
    /// [`is_waiting_for_certificate`] wait on that network latency.
    ///
    /// [`update`]: AssetManager::update
    /// [`is_waiting_for_certificate`]: AssetManager::is_waiting_for_certificate
    pub fn process(&self, record: AssetRecord, credential: &SessionCredential) -> ProcessingState {
        let asset_id = record.asset_id().to_string();
        let mut processors = self.processors.lock();

        if let Some(existing) = processors.get_mut(&asset_id) {
            return match record {
                AssetRecord::Certificate(asset) if existing.waiting_for_certificate() => {
                    info!(asset_id = %asset_id, "Signed certificate arrived for pending CSR");
                    existing.certificate_received(&asset, credential, &self.ctx);
                    existing.state().clone()
                }
                _ => {
                    let err = AssetError::Duplicate(asset_id.clone());
                    warn!(asset_id = %asset_id, "Duplicate asset rejected");
                    ProcessingState::failed(err.to_string())
                }
            };
        }

        let mut processor = AssetProcessor::for_record(&record);
        debug!(asset_id = %asset_id, asset_type = record.asset_type(), "Processing asset");
        processor.handle_asset(record, credential, &self.ctx);
        let state = processor.state().clone();
        processors.insert(asset_id, processor);
        state
    }

    /// Parse and process a raw JSON record.
    pub fn process_json(&self, json: &str, credential: &SessionCredential) -> ProcessingState {
        match AssetRecord::parse(json) {
            Ok(record) => self.process(record, credential),
            Err(err) => {
                warn!(error = %err, "Unparseable asset record");
                ProcessingState::failed(err.to_string())
            }
        }
    }

    /// Tick every processor and drop the finished ones.
    ///
    /// Returns the ids that completed during this call.
    pub fn update(&self) -> Vec<String> {
        let mut processors = self.processors.lock();
        let finished: Vec<String> = processors
            .iter_mut()
            .filter_map(|(id, processor)| processor.on_update().then(|| id.clone()))
            .collect();
        for id in &finished {
            if let Some(processor) = processors.remove(id) {
                debug!(asset_id = %id, status = ?processor.state().status, "Asset processor retired");
            }
        }
        finished
    }

    /// Whether any CSR is still waiting for its signed certificate.
    pub fn is_waiting_for_certificate(&self) -> bool {
        self.processors
            .lock()
            .values()
            .any(AssetProcessor::waiting_for_certificate)
    }

    /// Number of assets currently held by a processor.
    pub fn in_flight(&self) -> usize {
        self.processors.lock().len()
    }
}
