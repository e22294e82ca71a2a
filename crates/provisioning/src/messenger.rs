//! Reporting asset outcomes and CSRs back to the authority.

use std::sync::Arc;

use credagent_core::{Method, TransportClient};
use serde::Serialize;
use tracing::debug;

use crate::error::{AssetError, AssetResult};
use crate::status::{AssetStatus, ProcessingState};

/// Acknowledgement sent once an asset reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReceipt {
    pub asset_id: String,
    pub asset_type: String,
    pub success: bool,
    pub certificate_stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_stored: Option<bool>,
}

impl AssetReceipt {
    pub fn from_state(asset_id: &str, asset_type: &str, state: &ProcessingState) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            asset_type: asset_type.to_string(),
            success: state.status == AssetStatus::Success,
            certificate_stored: state.certificate_stored,
            private_key_stored: state.private_key_stored,
        }
    }

    pub fn to_json(&self) -> AssetResult<String> {
        serde_json::to_string(self).map_err(|e| AssetError::Messenger(e.to_string()))
    }
}

pub trait AssetMessenger: Send + Sync {
    fn acknowledge(&self, receipt_json: &str, error_message: Option<&str>) -> AssetResult<()>;

    fn submit_csr(&self, asset_id: &str, csr_pem: &str) -> AssetResult<()>;
}

/// Messenger that posts to the authority's ack and CSR endpoints.
pub struct TransportMessenger {
    transport: Arc<dyn TransportClient>,
    ack_url: String,
    csr_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AckBody<'a> {
    receipt: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsrBody<'a> {
    asset_id: &'a str,
    csr: &'a str,
}

impl TransportMessenger {
    pub fn new(transport: Arc<dyn TransportClient>, ack_url: String, csr_url: String) -> Self {
        Self {
            transport,
            ack_url,
            csr_url,
        }
    }

    fn post<T: Serialize>(&self, url: &str, body: &T) -> AssetResult<()> {
        let json = serde_json::to_string(body).map_err(|e| AssetError::Messenger(e.to_string()))?;
        self.transport
            .send(Method::Post, url, Some(&json))
            .map(|_| ())
            .map_err(|e| AssetError::Messenger(e.to_string()))
    }
}

impl AssetMessenger for TransportMessenger {
    fn acknowledge(&self, receipt_json: &str, error_message: Option<&str>) -> AssetResult<()> {
        let receipt =
            serde_json::from_str(receipt_json).map_err(|e| AssetError::Messenger(e.to_string()))?;
        self.post(
            &self.ack_url,
            &AckBody {
                receipt,
                error_message,
            },
        )?;
        debug!("Asset acknowledged");
        Ok(())
    }

    fn submit_csr(&self, asset_id: &str, csr_pem: &str) -> AssetResult<()> {
        self.post(
            &self.csr_url,
            &CsrBody {
                asset_id,
                csr: csr_pem,
            },
        )?;
        debug!(asset_id, "CSR submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credagent_core::testutil::ScriptedTransport;

    #[test]
    fn test_ack_body_shape() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok("/ack", "{}");
        let messenger = TransportMessenger::new(
            transport.clone(),
            "https://ca/ack".to_string(),
            "https://ca/csr".to_string(),
        );

        let mut state = ProcessingState::in_progress();
        state.certificate_stored = true;
        state.private_key_stored = Some(false);
        state.fail("disk full");
        let receipt = AssetReceipt::from_state("a-1", "certificate", &state);
        messenger
            .acknowledge(&receipt.to_json().unwrap(), state.error_message.as_deref())
            .unwrap();

        let sent = transport.requests();
        let body: serde_json::Value =
            serde_json::from_str(sent[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["receipt"]["assetId"], "a-1");
        assert_eq!(body["receipt"]["success"], false);
        assert_eq!(body["receipt"]["certificateStored"], true);
        assert_eq!(body["errorMessage"], "disk full");
    }

    #[test]
    fn test_transport_failure_is_messenger_error() {
        let transport = Arc::new(ScriptedTransport::new());
        let messenger = TransportMessenger::new(
            transport,
            "https://ca/ack".to_string(),
            "https://ca/csr".to_string(),
        );
        assert!(matches!(
            messenger.submit_csr("a-1", "PEM"),
            Err(AssetError::Messenger(_))
        ));
    }
}
