//! Session credentials memoized in front of the authentication engine.

use std::sync::Arc;

use credagent_core::CacheConfig;
use credagent_crypto::{CryptoError, CryptoResult, KeyResolver, SessionCredential};
use credagent_identity::{AuthError, AuthRequest, AuthenticationEngine};
use tracing::debug;

use crate::staleness::{CacheError, CacheKey, CacheResult, Clock, Lookup, StalenessCache, SystemClock};

/// Credential cache keyed by `(key_id or "", policy_id or "")`.
///
/// An empty key id means "the current credential" and runs a full
/// authentication; any other id is refreshed through key-by-id.
pub struct CredentialCache {
    engine: Arc<AuthenticationEngine>,
    cache: StalenessCache<SessionCredential>,
}

impl CredentialCache {
    pub fn new(engine: Arc<AuthenticationEngine>, config: CacheConfig) -> Self {
        Self::with_clock(engine, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        engine: Arc<AuthenticationEngine>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            cache: StalenessCache::with_clock(config, clock),
        }
    }

    pub fn key(key_id: Option<&str>, policy_id: Option<&str>) -> CacheKey {
        CacheKey::new(key_id.unwrap_or_default(), policy_id.unwrap_or_default())
    }

    pub fn get(
        &self,
        key_id: Option<&str>,
        policy_id: Option<&str>,
    ) -> CacheResult<Lookup<SessionCredential>> {
        self.get_with(key_id, &AuthRequest::for_policy(policy_id))
    }

    /// Look up with a full request, e.g. to carry an asset id or app hash.
    pub fn get_with(
        &self,
        key_id: Option<&str>,
        request: &AuthRequest,
    ) -> CacheResult<Lookup<SessionCredential>> {
        let key = Self::key(key_id, request.policy_id.as_deref());
        let lookup = self.cache.lookup(&key, |k| {
            let result = if k.primary.is_empty() {
                self.engine.authenticate(request)
            } else {
                self.engine.fetch_key_by_id(&k.primary, request)
            };
            match result {
                Ok(credential) => Ok(Lookup::Found(credential)),
                Err(err) => map_auth_error(err),
            }
        })?;

        // The current credential is also reachable by its own id, with and
        // without the policy it was obtained for
        if let (None, Lookup::Found(credential)) = (key_id, &lookup) {
            let own_id = Some(credential.key_id());
            self.cache.seed(
                Self::key(own_id, request.policy_id.as_deref()),
                credential.clone(),
            );
            if request.policy_id.is_some() {
                self.cache.seed(Self::key(own_id, None), credential.clone());
            }
        }
        Ok(lookup)
    }

    /// Current credential for a policy; authentication always yields one.
    pub fn current(&self, policy_id: Option<&str>) -> CacheResult<SessionCredential> {
        match self.get(None, policy_id)? {
            Lookup::Found(credential) => Ok(credential),
            Lookup::NotFound => Err(CacheError::Upstream(
                "authentication returned no credential".to_string(),
            )),
        }
    }

    pub fn invalidate(&self, key_id: Option<&str>, policy_id: Option<&str>) -> bool {
        self.cache.invalidate(&Self::key(key_id, policy_id))
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn map_auth_error(err: AuthError) -> CacheResult<Lookup<SessionCredential>> {
    match err {
        AuthError::KeyNotFound(key_id) => {
            debug!(%key_id, "Key unknown to authority, caching absence");
            Ok(Lookup::NotFound)
        }
        AuthError::NotAuthorized { message, .. } => Err(CacheError::NotAllowed(message)),
        other => Err(CacheError::Upstream(other.to_string())),
    }
}

impl KeyResolver for CredentialCache {
    fn resolve(&self, key_id: &str) -> CryptoResult<SessionCredential> {
        match self.get(Some(key_id), None) {
            Ok(Lookup::Found(credential)) => Ok(credential),
            Ok(Lookup::NotFound) => Err(CryptoError::KeyUnavailable(key_id.to_string())),
            Err(err) => Err(CryptoError::KeyUnavailable(format!("{}: {}", key_id, err))),
        }
    }
}
