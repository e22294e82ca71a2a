//! Key pair and certificate signing request generation.

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use zeroize::Zeroizing;

use crate::asset::CertificateDataAsset;
use crate::error::{AssetError, AssetResult};

pub struct GeneratedCsr {
    pub csr_pem: String,
    pub private_key_pem: Zeroizing<String>,
}

pub trait CsrGenerator: Send + Sync {
    fn generate(&self, instructions: &CertificateDataAsset) -> AssetResult<GeneratedCsr>;
}

/// ECDSA P-256 keys and PKCS#10 requests via rcgen.
#[derive(Debug, Default, Clone, Copy)]
pub struct RcgenCsrGenerator;

impl CsrGenerator for RcgenCsrGenerator {
    fn generate(&self, instructions: &CertificateDataAsset) -> AssetResult<GeneratedCsr> {
        let subject = &instructions.subject;
        if subject.common_name.trim().is_empty() {
            return Err(AssetError::MissingField("subject.commonName"));
        }

        let mut params = CertificateParams::new(instructions.subject_alt_names.clone())
            .map_err(|e| AssetError::Csr(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name.as_str());
        let optional = [
            (DnType::OrganizationName, &subject.organization),
            (DnType::OrganizationalUnitName, &subject.organizational_unit),
            (DnType::CountryName, &subject.country),
            (DnType::StateOrProvinceName, &subject.state),
            (DnType::LocalityName, &subject.locality),
        ];
        for (kind, value) in optional {
            if let Some(value) = value {
                dn.push(kind, value.as_str());
            }
        }
        params.distinguished_name = dn;
        if instructions.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }

        let key_pair = KeyPair::generate().map_err(|e| AssetError::Csr(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AssetError::Csr(e.to_string()))?;

        Ok(GeneratedCsr {
            csr_pem: csr.pem().map_err(|e| AssetError::Csr(e.to_string()))?,
            private_key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }
}
