//! The periodic provisioning loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use credagent_cache::{fetch_policies, CacheError, CredentialCache, PolicyStore};
use credagent_core::{AgentConfig, EventSink, Method, TransportClient, TransportError};
use credagent_crypto::SessionCredential;
use credagent_identity::{provider_from_config, AuthenticationEngine};
use credagent_provisioning::{
    AssetManager, AssetStatus, FilesystemBackend, ProvisioningContext, TransportMessenger,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Direction the asset channel is matched under in the policy set.
const ASSET_CHANNEL_DIRECTION: &str = "outbound";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssetPoll<'a> {
    key_id: &'a str,
}

#[derive(Deserialize)]
struct AssetBatch {
    #[serde(default)]
    assets: Vec<serde_json::Value>,
}

/// Outcome of one tick of the loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub completed: Vec<String>,
}

pub struct Agent {
    config: AgentConfig,
    transport: Arc<dyn TransportClient>,
    engine: Arc<AuthenticationEngine>,
    credentials: Arc<CredentialCache>,
    policies: PolicyStore,
    assets: AssetManager,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn TransportClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let provider = provider_from_config(&config.identity);
        let engine = Arc::new(AuthenticationEngine::new(
            config.server.clone(),
            config.identity.clone(),
            transport.clone(),
            provider,
            events.clone(),
        ));
        let credentials = Arc::new(CredentialCache::new(
            engine.clone(),
            config.cache.credentials,
        ));
        let policies = PolicyStore::new(config.cache.policies);

        let messenger = Arc::new(TransportMessenger::new(
            transport.clone(),
            config.server.url(&config.server.endpoints.asset_ack),
            config.server.url(&config.server.endpoints.csr),
        ));
        let ctx = ProvisioningContext::new(
            Arc::new(FilesystemBackend::from_config(&config.storage)),
            messenger,
            events,
        )
        .with_resolver(credentials.clone())
        .with_base64_envelope(config.storage.base64_envelope);

        Self {
            config,
            transport,
            engine,
            credentials,
            policies,
            assets: AssetManager::new(ctx),
        }
    }

    pub fn init(&self) -> Result<()> {
        self.engine
            .init()
            .context("Failed to initialise authentication engine")
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    /// Poll for assets once and process what arrives.
    pub fn tick(&self) -> Result<TickReport> {
        let assets_url = self.config.server.url(&self.config.server.endpoints.assets);
        let policy_id = self.asset_channel_policy(&assets_url)?;
        let credential = self
            .credentials
            .current(policy_id.as_deref())
            .context("Failed to obtain session credential")?;

        let body = serde_json::to_string(&AssetPoll {
            key_id: credential.key_id(),
        })?;
        let response = match self.transport.send(Method::Post, &assets_url, Some(&body)) {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, TransportError::Status { code: 401 | 403, .. }) {
                    // Force a fresh authentication next time
                    self.credentials.invalidate(None, policy_id.as_deref());
                }
                return Err(err).context("Asset poll failed");
            }
        };

        let mut report = self.process_batch(&response, &credential)?;
        report.completed = self.assets.update();
        Ok(report)
    }

    /// How long to sleep after a tick.
    pub fn next_delay(&self, outcome: &Result<TickReport>) -> Duration {
        if outcome.is_err() {
            self.config.server.retry_interval()
        } else if self.assets.is_waiting_for_certificate() {
            Duration::from_secs(self.config.certificate_poll_interval_secs)
        } else {
            Duration::from_secs(self.config.poll_interval_secs)
        }
    }

    fn asset_channel_policy(&self, assets_url: &str) -> Result<Option<String>> {
        let policies_url = self.config.server.url(&self.config.server.endpoints.policies);
        let found = self.policies.find(
            host_of(assets_url),
            ASSET_CHANNEL_DIRECTION,
            "POST",
            assets_url,
            || fetch_policies(self.transport.as_ref(), &policies_url),
        );
        match found {
            Ok(policy) => Ok(policy.map(|p| p.id)),
            // An authority without a policy endpoint serves unscoped credentials
            Err(CacheError::NotAllowed(reason)) => {
                debug!(%reason, "Policies not available to this device");
                Ok(None)
            }
            Err(err) => Err(err).context("Policy refresh failed"),
        }
    }

    fn process_batch(&self, response: &str, credential: &SessionCredential) -> Result<TickReport> {
        let batch: AssetBatch =
            serde_json::from_str(response).context("Malformed asset poll response")?;
        let mut report = TickReport {
            received: batch.assets.len(),
            ..Default::default()
        };

        for record in batch.assets {
            let state = self.assets.process_json(&record.to_string(), credential);
            match state.status {
                AssetStatus::Success => report.succeeded += 1,
                AssetStatus::Failure => {
                    warn!(error = ?state.error_message, "Asset failed");
                    report.failed += 1;
                }
                AssetStatus::InProgress => {}
            }
        }

        if report.received > 0 {
            info!(
                received = report.received,
                succeeded = report.succeeded,
                failed = report.failed,
                "Asset batch processed"
            );
        }
        Ok(report)
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    authority.split(':').next().unwrap_or(authority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use credagent_core::testutil::ScriptedTransport;
    use credagent_core::RecordingEventSink;
    use credagent_crypto::{encode_b64, SessionCredential};

    const AUTH_KEY: [u8; 32] = [0x31; 32];
    const AUTH_IV: [u8; 16] = [0x41; 16];

    struct Fixture {
        agent: Agent,
        transport: Arc<ScriptedTransport>,
        events: Arc<RecordingEventSink>,
        base: std::path::PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    fn fixture() -> Fixture {
        let base = std::env::temp_dir().join(format!("credagent-node-{}", uuid::Uuid::new_v4()));
        let mut config = AgentConfig::default_config();
        config.storage.cert_dir = base.join("certs");
        config.storage.key_dir = base.join("keys");

        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(RecordingEventSink::new());
        let agent = Agent::new(config, transport.clone(), events.clone());
        Fixture {
            agent,
            transport,
            events,
            base,
        }
    }

    fn script_auth(transport: &ScriptedTransport, key_id: &str) {
        transport
            .push_ok("/auth/challenge", r#"{"challenge":"nonce","registered":true}"#)
            .push_ok(
                "/auth/key",
                serde_json::json!({
                    "keyId": key_id,
                    "key": encode_b64(&AUTH_KEY),
                    "iv": encode_b64(&AUTH_IV),
                })
                .to_string(),
            );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://ca.example:8443/api/v1/assets"), "ca.example");
        assert_eq!(host_of("http://localhost/x"), "localhost");
        assert_eq!(host_of("ca.example"), "ca.example");
    }

    #[test]
    fn test_tick_provisions_certificate() {
        let fx = fixture();
        let cred = SessionCredential::new("kid-1", AUTH_KEY.to_vec(), AUTH_IV.to_vec()).unwrap();
        let certificate = encode_b64(
            &cred
                .encrypt(b"-----BEGIN CERTIFICATE-----\nMII\n-----END CERTIFICATE-----\n")
                .unwrap(),
        );

        fx.transport.push_ok("/api/v1/policies", r#"{"policies":[]}"#);
        script_auth(&fx.transport, "kid-1");
        fx.transport
            .push_ok(
                "/api/v1/assets",
                serde_json::json!({
                    "assets": [{
                        "assetType": "certificate",
                        "assetId": "a-1",
                        "fileName": "device",
                        "certificate": certificate,
                    }]
                })
                .to_string(),
            )
            .push_ok("/api/v1/assets/ack", "{}");

        let report = fx.agent.tick().unwrap();
        assert_eq!(report.received, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.completed, vec!["a-1".to_string()]);
        assert_eq!(fx.events.count("certificate_stored"), 1);
        assert!(fx.base.join("certs").join("device.pem").exists());

        let poll = &fx.transport.requests()[3];
        let body: serde_json::Value = serde_json::from_str(poll.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["keyId"], "kid-1");
        assert_eq!(fx.transport.remaining(), 0);
    }

    #[test]
    fn test_unauthorized_poll_invalidates_credential() {
        let fx = fixture();
        fx.transport.push_ok("/api/v1/policies", r#"{"policies":[]}"#);
        script_auth(&fx.transport, "kid-1");
        fx.transport.push_status("/api/v1/assets", 401, "");
        script_auth(&fx.transport, "kid-2");
        fx.transport.push_ok("/api/v1/assets", r#"{"assets":[]}"#);

        let outcome = fx.agent.tick();
        assert!(outcome.is_err());
        assert_eq!(
            fx.agent.next_delay(&outcome),
            Duration::from_secs(fx.agent.config.server.retry_interval_secs)
        );

        let report = fx.agent.tick().unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(fx.transport.calls_to("/auth/challenge"), 2);
    }

    #[test]
    fn test_policy_endpoint_forbidden_is_unscoped() {
        let fx = fixture();
        fx.transport.push_status("/api/v1/policies", 403, "");
        script_auth(&fx.transport, "kid-1");
        fx.transport.push_ok("/api/v1/assets", r#"{"assets":[]}"#);

        let outcome = fx.agent.tick();
        assert!(outcome.is_ok());
        assert_eq!(
            fx.agent.next_delay(&outcome),
            Duration::from_secs(fx.agent.config.poll_interval_secs)
        );
    }
}
