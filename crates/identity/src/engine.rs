//! Challenge, registration and key exchange against the authority.
//!
//! The protocol runs as a loop over [`AuthState`] while the engine lock is
//! held, so concurrent callers serialize and registration never re-enters the
//! lock. No request is retried here; callers re-run after the configured
//! retry interval.

use std::sync::Arc;

use credagent_core::config::{IdentityConfig, ServerConfig, Topology};
use credagent_core::{EventSink, Method, TransportClient, TransportError};
use credagent_crypto::{sign_app_hash, SessionCredential};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{AuthError, AuthResult};
use crate::protocol::{
    ChallengeRequest, ChallengeResponse, KeyByIdRequest, KeyRequest, KeyResponse,
    RegisterRequest, RegisterResponse, ServerMessage,
};
use crate::provider::{IdentityProvider, KeyParams};
use crate::state::{AuthState, AuthStateMachine};

/// Per-call inputs to an authentication round trip.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub policy_id: Option<String>,
    pub asset_id: Option<String>,
    pub app_hash: Option<String>,
    /// Send `app_hash` as an HMAC under `signing_credential`
    pub sign_app_hash: bool,
    pub signing_credential: Option<SessionCredential>,
}

impl AuthRequest {
    pub fn for_policy(policy_id: Option<&str>) -> Self {
        Self {
            policy_id: policy_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_asset(mut self, asset_id: &str) -> Self {
        self.asset_id = Some(asset_id.to_string());
        self
    }

    pub fn with_app_hash(mut self, app_hash: &str, sign: bool) -> Self {
        self.app_hash = Some(app_hash.to_string());
        self.sign_app_hash = sign;
        self
    }

    pub fn signed_with(mut self, credential: SessionCredential) -> Self {
        self.signing_credential = Some(credential);
        self
    }
}

enum ChallengeOutcome {
    RegistrationRequired,
    Challenge(String),
}

pub struct AuthenticationEngine {
    server: ServerConfig,
    identity: IdentityConfig,
    transport: Arc<dyn TransportClient>,
    provider: Arc<dyn IdentityProvider>,
    events: Arc<dyn EventSink>,
    state: Mutex<AuthStateMachine>,
}

impl AuthenticationEngine {
    pub fn new(
        server: ServerConfig,
        identity: IdentityConfig,
        transport: Arc<dyn TransportClient>,
        provider: Arc<dyn IdentityProvider>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            server,
            identity,
            transport,
            provider,
            events,
            state: Mutex::new(AuthStateMachine::new()),
        }
    }

    pub fn init(&self) -> AuthResult<()> {
        self.provider.init()?;
        self.events.notify_startup();
        info!(
            topology = ?self.server.topology,
            base_url = %self.server.base_url,
            "Authentication engine initialised"
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        self.provider.shutdown();
        self.events.notify_shutdown();
        info!("Authentication engine shut down");
    }

    /// Snapshot of the state after the most recent call.
    pub fn state(&self) -> AuthState {
        self.state.lock().current_state().clone()
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history().len()
    }

    /// Run challenge, optional registration and key request to completion.
    #[instrument(skip(self, request), fields(policy_id = ?request.policy_id))]
    pub fn authenticate(&self, request: &AuthRequest) -> AuthResult<SessionCredential> {
        let mut sm = self.state.lock();
        self.run(&mut sm, request)
    }

    /// Authenticate, then fetch an already-issued key by id.
    ///
    /// The returned key and iv are ciphertexts under the credential of the
    /// authentication round trip.
    #[instrument(skip(self, request))]
    pub fn fetch_key_by_id(
        &self,
        key_id: &str,
        request: &AuthRequest,
    ) -> AuthResult<SessionCredential> {
        let mut sm = self.state.lock();
        let auth = self.run(&mut sm, request)?;

        let body = KeyByIdRequest {
            key_id: auth.key_id().to_string(),
            requested_key_id: key_id.to_string(),
            policy_id: request.policy_id.clone(),
        };
        let url = self.server.url(&self.server.endpoints.key_by_id);
        let reply = self
            .transport
            .send(Method::Post, &url, Some(&serde_json::to_string(&body)?))
            .map_err(|e| key_endpoint_error(e, Some(key_id)))?;

        let response: KeyResponse = serde_json::from_str(&reply)?;
        let key = auth.decrypt_b64("key", &response.key)?;
        let iv = auth.decrypt_b64("iv", &response.iv)?;
        let resolved_id = if response.key_id.is_empty() {
            key_id.to_string()
        } else {
            response.key_id
        };
        debug!(key_id = %resolved_id, "Key fetched by id");
        Ok(SessionCredential::new(resolved_id, key, iv)?)
    }

    fn run(&self, sm: &mut AuthStateMachine, request: &AuthRequest) -> AuthResult<SessionCredential> {
        let current = sm.current_state();
        if *current != AuthState::Init && !current.is_terminal() {
            // A panicking caller left a round trip half done
            sm.on_failure(&AuthError::InvalidTransition(
                "previous round trip abandoned".to_string(),
            ));
        }
        sm.begin()?;
        let result = self.drive(sm, request);
        if let Err(err) = &result {
            warn!(error = %err, "Authentication failed");
            sm.on_failure(err);
        }
        result
    }

    fn drive(&self, sm: &mut AuthStateMachine, request: &AuthRequest) -> AuthResult<SessionCredential> {
        let mut challenge: Option<String> = None;
        loop {
            match sm.current_state().clone() {
                AuthState::AwaitingChallenge => match self.request_challenge(request)? {
                    ChallengeOutcome::RegistrationRequired => {
                        sm.on_registration_required()?;
                        self.events.notify_registration_required();
                    }
                    ChallengeOutcome::Challenge(value) => {
                        sm.on_challenge_received(&value)?;
                        challenge = Some(value);
                    }
                },
                AuthState::RegistrationRequired => {
                    sm.on_registering()?;
                    self.events.notify_registration_in_progress();
                }
                AuthState::Registering => match self.register() {
                    Ok(()) => {
                        self.events.notify_registration_success();
                        sm.on_registered()?;
                    }
                    Err(err) => {
                        self.events.notify_registration_failure(&err.to_string());
                        return Err(err);
                    }
                },
                AuthState::Authenticating { .. } => {
                    let value = challenge.take().ok_or_else(|| {
                        AuthError::InvalidTransition("no challenge held while authenticating".to_string())
                    })?;
                    let credential = self.request_key(&value, request)?;
                    sm.on_authenticated(credential.key_id())?;
                    info!(key_id = %credential.key_id(), "Device authenticated");
                    return Ok(credential);
                }
                state @ (AuthState::Init | AuthState::Authenticated { .. } | AuthState::Failed { .. }) => {
                    return Err(AuthError::InvalidTransition(format!(
                        "protocol loop reached {:?}",
                        state
                    )));
                }
            }
        }
    }

    fn key_params(&self, rotation_metadata: Option<serde_json::Value>) -> KeyParams {
        let mut params = KeyParams::from_config(&self.identity);
        params.rotation_metadata = rotation_metadata;
        params
    }

    fn request_challenge(&self, request: &AuthRequest) -> AuthResult<ChallengeOutcome> {
        let device_key = self.provider.get_device_key(None, &self.key_params(None))?;
        let body = ChallengeRequest {
            device_key: device_key.to_value()?,
            user_agent: self.server.user_agent.clone(),
            user_id: self.server.user_id.clone(),
            policy_id: request.policy_id.clone(),
        };
        let url = self.server.url(&self.server.endpoints.challenge);

        let reply = match self
            .transport
            .send(Method::Post, &url, Some(&serde_json::to_string(&body)?))
        {
            Ok(reply) => reply,
            Err(TransportError::Status { code, .. })
                if self.server.topology == Topology::Edge
                    && code == self.server.no_device_status_code =>
            {
                debug!(code, "Edge authority does not know this identity key");
                return Ok(ChallengeOutcome::RegistrationRequired);
            }
            Err(TransportError::Status { code, body }) => {
                let msg = ServerMessage::parse(&body);
                return Err(AuthError::ChallengeFailed {
                    message: msg.message_or("challenge request rejected"),
                    status_code: msg.status_code.or(Some(code)),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let response: ChallengeResponse = serde_json::from_str(&reply)?;
        if response.requires_registration() {
            return Ok(ChallengeOutcome::RegistrationRequired);
        }
        match (response.challenge, response.registered) {
            (Some(challenge), Some(true)) if !challenge.is_empty() => {
                Ok(ChallengeOutcome::Challenge(challenge))
            }
            _ => Err(AuthError::ChallengeFailed {
                message: response
                    .message
                    .unwrap_or_else(|| "challenge response carried no usable challenge".to_string()),
                status_code: response.status_code,
            }),
        }
    }

    fn register(&self) -> AuthResult<()> {
        let device_key = self.provider.get_device_key(None, &self.key_params(None))?;
        let body = RegisterRequest {
            device_key: device_key.to_value()?,
            device_tid: self.provider.device_tid()?,
            role: self.identity.role.clone(),
            metadata: self.identity.metadata.clone(),
            user_agent: self.server.user_agent.clone(),
            user_id: self.server.user_id.clone(),
        };
        let url = self.server.url(&self.server.endpoints.register);

        let reply = match self
            .transport
            .send(Method::Post, &url, Some(&serde_json::to_string(&body)?))
        {
            Ok(reply) => reply,
            Err(TransportError::Status { code, body }) => {
                let msg = ServerMessage::parse(&body);
                return Err(AuthError::RegistrationDenied {
                    message: msg.message_or("registration rejected"),
                    status_code: msg.status_code.or(Some(code)),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let response: RegisterResponse = if reply.trim().is_empty() {
            RegisterResponse::default()
        } else {
            serde_json::from_str(&reply)?
        };
        if response.registered == Some(false) {
            return Err(AuthError::RegistrationDenied {
                message: response
                    .message
                    .unwrap_or_else(|| "authority did not register the device".to_string()),
                status_code: response.status_code,
            });
        }
        info!("Device registered");
        Ok(())
    }

    fn fetch_rotation_metadata(&self) -> AuthResult<serde_json::Value> {
        let url = self.server.url(&self.server.endpoints.rotation_metadata);
        let reply = self.transport.send(Method::Get, &url, None)?;
        Ok(serde_json::from_str(&reply)?)
    }

    fn request_key(&self, challenge: &str, request: &AuthRequest) -> AuthResult<SessionCredential> {
        self.events.notify_authorization_in_progress();

        let rotation = match self.server.topology {
            Topology::Edge => Some(self.fetch_rotation_metadata()?),
            Topology::Central => None,
        };
        let device_key = self
            .provider
            .get_device_key(Some(challenge), &self.key_params(rotation))?;

        let (app_hash, app_hash_key_id) = app_hash_field(request)?;
        let body = KeyRequest {
            device_key: device_key.to_value()?,
            policy_id: request.policy_id.clone(),
            asset_id: request.asset_id.clone(),
            app_hash,
            app_hash_key_id,
        };
        let url = self.server.url(&self.server.endpoints.key);
        let reply = self
            .transport
            .send(Method::Post, &url, Some(&serde_json::to_string(&body)?))
            .map_err(|e| key_endpoint_error(e, None))?;

        let response: KeyResponse = serde_json::from_str(&reply)?;
        if response.key_id.is_empty() {
            return Err(AuthError::Protocol("key response has an empty keyId".to_string()));
        }
        Ok(SessionCredential::from_base64(
            response.key_id,
            &response.key,
            &response.iv,
        )?)
    }
}

/// Raw or HMAC-signed app hash, with the id of the signing key.
fn app_hash_field(request: &AuthRequest) -> AuthResult<(Option<String>, Option<String>)> {
    let Some(app_hash) = request.app_hash.as_deref() else {
        return Ok((None, None));
    };
    match (request.sign_app_hash, request.signing_credential.as_ref()) {
        (true, Some(credential)) => Ok((
            Some(sign_app_hash(app_hash, credential.key())?),
            Some(credential.key_id().to_string()),
        )),
        (true, None) => {
            debug!("No signing credential held, sending app hash unsigned");
            Ok((Some(app_hash.to_string()), None))
        }
        (false, _) => Ok((Some(app_hash.to_string()), None)),
    }
}

fn key_endpoint_error(err: TransportError, key_id: Option<&str>) -> AuthError {
    match err {
        TransportError::Status { code, body } if code == 401 || code == 403 => {
            let msg = ServerMessage::parse(&body);
            AuthError::NotAuthorized {
                message: msg.message_or("key request not authorized"),
                status_code: msg.status_code.or(Some(code)),
            }
        }
        TransportError::Status { code: 404, .. } if key_id.is_some() => {
            AuthError::KeyNotFound(key_id.unwrap_or_default().to_string())
        }
        other => AuthError::Transport(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_endpoint_error_mapping() {
        let denied = key_endpoint_error(
            TransportError::Status {
                code: 403,
                body: r#"{"message":"policy forbids"}"#.to_string(),
            },
            None,
        );
        assert!(matches!(
            denied,
            AuthError::NotAuthorized { ref message, status_code: Some(403) } if message == "policy forbids"
        ));

        let missing = key_endpoint_error(
            TransportError::Status {
                code: 404,
                body: String::new(),
            },
            Some("kid-9"),
        );
        assert!(matches!(missing, AuthError::KeyNotFound(ref id) if id == "kid-9"));

        let plain_404 = key_endpoint_error(
            TransportError::Status {
                code: 404,
                body: String::new(),
            },
            None,
        );
        assert!(matches!(plain_404, AuthError::Transport(_)));
    }

    #[test]
    fn test_app_hash_signing() {
        let credential = SessionCredential::new("sign-kid", vec![2u8; 32], vec![0u8; 16]).unwrap();
        let request = AuthRequest::default()
            .with_app_hash("hash-1", true)
            .signed_with(credential.clone());
        let (hash, key_id) = app_hash_field(&request).unwrap();
        assert_eq!(hash, Some(sign_app_hash("hash-1", credential.key()).unwrap()));
        assert_eq!(key_id.as_deref(), Some("sign-kid"));

        let unsigned = AuthRequest::default().with_app_hash("hash-1", true);
        assert_eq!(app_hash_field(&unsigned).unwrap(), (Some("hash-1".to_string()), None));
    }
}
