//! Asset records delivered by the authority.
//!
//! Records are self-describing JSON objects tagged by `assetType`:
//!
//! ```json
//! {"assetType": "certificate", "assetId": "a-1", "fileName": "device",
//!  "certificate": "<b64 ciphertext>", "privateKey": "<b64 ciphertext>",
//!  "storeEncrypted": true}
//! {"assetType": "certificatedata", "assetId": "a-2", "fileName": "gateway",
//!  "subject": {"commonName": "gw-17"}, "isCa": false, "storeEncrypted": false}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::AssetError;

pub const CERTIFICATE: &str = "certificate";
pub const CERTIFICATE_DATA: &str = "certificatedata";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "assetType")]
pub enum AssetRecord {
    #[serde(rename = "certificate")]
    Certificate(CertificateAsset),
    #[serde(rename = "certificatedata")]
    CertificateData(CertificateDataAsset),
}

impl AssetRecord {
    pub fn parse(json: &str) -> Result<Self, AssetError> {
        serde_json::from_str(json).map_err(|e| AssetError::Malformed(e.to_string()))
    }

    pub fn asset_id(&self) -> &str {
        match self {
            AssetRecord::Certificate(a) => &a.asset_id,
            AssetRecord::CertificateData(a) => &a.asset_id,
        }
    }

    pub fn asset_type(&self) -> &'static str {
        match self {
            AssetRecord::Certificate(_) => CERTIFICATE,
            AssetRecord::CertificateData(_) => CERTIFICATE_DATA,
        }
    }
}

/// An issued certificate, optionally with a server-generated private key.
///
/// `certificate` and `private_key` are base64 ciphertexts under the session
/// credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAsset {
    pub asset_id: String,
    /// Base name for the stored artifacts
    pub file_name: String,
    pub certificate: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub store_encrypted: bool,
    #[serde(default)]
    pub sign_apphash: bool,
}

/// Instructions for a device-generated key pair and CSR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDataAsset {
    pub asset_id: String,
    pub file_name: String,
    pub subject: CsrSubject,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub is_ca: bool,
    #[serde(default)]
    pub store_encrypted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrSubject {
    pub common_name: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub organizational_unit: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_certificate_record() {
        let record = AssetRecord::parse(
            r#"{"assetType":"certificate","assetId":"a-1","fileName":"dev",
                "certificate":"AAAA","storeEncrypted":true}"#,
        )
        .unwrap();
        assert_eq!(record.asset_id(), "a-1");
        assert_eq!(record.asset_type(), CERTIFICATE);
        match record {
            AssetRecord::Certificate(cert) => {
                assert!(cert.store_encrypted);
                assert!(cert.private_key.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_certificate_data_record() {
        let record = AssetRecord::parse(
            r#"{"assetType":"certificatedata","assetId":"a-2","fileName":"gw",
                "subject":{"commonName":"gw-17","organization":"Acme"},"isCa":true}"#,
        )
        .unwrap();
        match record {
            AssetRecord::CertificateData(data) => {
                assert_eq!(data.subject.common_name, "gw-17");
                assert_eq!(data.subject.organization.as_deref(), Some("Acme"));
                assert!(data.is_ca);
                assert!(!data.store_encrypted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            AssetRecord::parse(r#"{"assetType":"firmware","assetId":"x"}"#),
            Err(AssetError::Malformed(_))
        ));
    }
}
