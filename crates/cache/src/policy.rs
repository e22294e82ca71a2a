//! Server-issued payload policies.
//!
//! The store holds the whole policy set and refreshes it in one piece: a
//! stale set is replaced wholesale, never merged. Matching walks the set in
//! priority order (lower value first) and returns the first hit.

use std::sync::Arc;
use std::time::Instant;

use credagent_core::{CacheConfig, Method, TransportClient};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::staleness::{CacheError, CacheResult, Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    pub id: String,
    pub operation: Operation,
    /// Empty matches any domain
    #[serde(default)]
    pub domain: String,
    /// Empty matches any direction
    #[serde(default)]
    pub direction: String,
    /// `*` matches any run of characters
    pub url_pattern: String,
    /// Empty matches any method
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub payload_type: String,
    #[serde(default)]
    pub cryption_path: String,
    #[serde(default)]
    pub key_rotation: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

impl Policy {
    pub fn matches(&self, domain: &str, direction: &str, method: &str, url: &str) -> bool {
        field_matches(&self.domain, domain)
            && field_matches(&self.direction, direction)
            && field_matches(&self.method, method)
            && wildcard_match(&self.url_pattern, url)
    }
}

fn field_matches(policy_value: &str, value: &str) -> bool {
    policy_value.is_empty() || policy_value == "*" || policy_value.eq_ignore_ascii_case(value)
}

/// Glob match supporting only `*`.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            resume = ti;
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    policies: Vec<Policy>,
}

/// Parse a `{"policies": [...]}` document.
pub fn parse_policies(body: &str) -> CacheResult<Vec<Policy>> {
    serde_json::from_str::<PolicyDocument>(body)
        .map(|doc| doc.policies)
        .map_err(|e| CacheError::Upstream(format!("malformed policy document: {}", e)))
}

/// Fetch the policy set with a GET to `url`.
pub fn fetch_policies(transport: &dyn TransportClient, url: &str) -> CacheResult<Vec<Policy>> {
    match transport.send(Method::Get, url, None) {
        Ok(body) => parse_policies(&body),
        Err(err) if matches!(err.status_code(), Some(401) | Some(403)) => {
            Err(CacheError::NotAllowed(err.to_string()))
        }
        Err(err) => Err(CacheError::Upstream(err.to_string())),
    }
}

#[derive(Default)]
struct PolicySet {
    policies: Vec<Policy>,
    last_refreshed_at: Option<Instant>,
    force_stale: bool,
}

pub struct PolicyStore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PolicySet>,
}

impl PolicyStore {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(PolicySet::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// First policy in priority order matching the request, refreshing the
    /// set first when it is stale.
    pub fn find<F>(
        &self,
        domain: &str,
        direction: &str,
        method: &str,
        url: &str,
        fetch: F,
    ) -> CacheResult<Option<Policy>>
    where
        F: FnOnce() -> CacheResult<Vec<Policy>>,
    {
        let mut set = self.state.lock();
        if self.is_stale(&set) {
            match fetch() {
                Ok(mut policies) => {
                    policies.sort_by_key(|p| p.priority);
                    info!(count = policies.len(), "Policy set refreshed");
                    set.policies = policies;
                    set.last_refreshed_at = Some(self.clock.now());
                    set.force_stale = false;
                }
                Err(err) => {
                    warn!(error = %err, "Policy refresh failed, discarding cached set");
                    *set = PolicySet::default();
                    return Err(err);
                }
            }
        }

        let hit = set
            .policies
            .iter()
            .find(|p| p.matches(domain, direction, method, url))
            .cloned();
        debug!(%domain, %direction, %method, %url, matched = ?hit.as_ref().map(|p| &p.id), "Policy lookup");
        Ok(hit)
    }

    /// Snapshot of the cached set in priority order.
    pub fn policies(&self) -> Vec<Policy> {
        self.state.lock().policies.clone()
    }

    pub fn invalidate(&self) {
        self.state.lock().force_stale = true;
    }

    fn is_stale(&self, set: &PolicySet) -> bool {
        match set.last_refreshed_at {
            None => true,
            Some(_) if set.force_stale => true,
            Some(at) => self
                .config
                .refresh_interval
                .is_expired(self.clock.now().saturating_duration_since(at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staleness::ManualClock;
    use credagent_core::RefreshInterval;
    use std::cell::Cell;
    use std::time::Duration;

    const DOC: &str = r#"{
        "policies": [
            {"name": "catch-all", "id": "p-any", "operation": "ENCRYPT",
             "urlPattern": "*", "priority": 100},
            {"name": "orders", "id": "p-orders", "operation": "DECRYPT",
             "domain": "shop.example", "direction": "inbound", "method": "POST",
             "urlPattern": "/api/*/orders", "payloadType": "json",
             "cryptionPath": "$.card", "keyRotation": "daily", "priority": 1}
        ]
    }"#;

    fn store() -> (PolicyStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig::new(RefreshInterval::from_secs(60), Duration::from_secs(10));
        (PolicyStore::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("/api/*/orders", "/api/v2/orders"));
        assert!(wildcard_match("/api/*", "/api/v2/orders"));
        assert!(!wildcard_match("/api/*/orders", "/api/v2/items"));
        assert!(wildcard_match("*.json", "a.b.json"));
        assert!(!wildcard_match("/exact", "/exact/more"));
    }

    #[test]
    fn test_first_match_in_priority_order() {
        let (store, _) = store();
        let hit = store
            .find("shop.example", "inbound", "post", "/api/v2/orders", || parse_policies(DOC))
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, "p-orders");
        assert_eq!(hit.operation, Operation::Decrypt);

        let fallback = store
            .find("other.example", "outbound", "GET", "/health", || unreachable!())
            .unwrap()
            .unwrap();
        assert_eq!(fallback.id, "p-any");
        assert_eq!(store.policies()[0].id, "p-orders");
    }

    #[test]
    fn test_replace_all_refresh() {
        let (store, clock) = store();
        store
            .find("", "", "", "/x", || parse_policies(DOC))
            .unwrap();
        assert_eq!(store.policies().len(), 2);

        clock.advance(Duration::from_secs(61));
        let replacement = r#"{"policies": [
            {"name": "only", "id": "p-only", "operation": "ENCRYPT", "urlPattern": "/x"}
        ]}"#;
        let hit = store
            .find("", "", "", "/x", || parse_policies(replacement))
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, "p-only");
        assert_eq!(store.policies().len(), 1);
    }

    #[test]
    fn test_refresh_only_when_stale_or_invalidated() {
        let (store, clock) = store();
        let calls = Cell::new(0);
        let fetch = || {
            calls.set(calls.get() + 1);
            parse_policies(DOC)
        };

        store.find("", "", "", "/a", fetch).unwrap();
        clock.advance(Duration::from_secs(30));
        store.find("", "", "", "/a", fetch).unwrap();
        assert_eq!(calls.get(), 1);

        store.invalidate();
        store.find("", "", "", "/a", fetch).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_failed_refresh_discards_set() {
        let (store, _) = store();
        store.find("", "", "", "/a", || parse_policies(DOC)).unwrap();
        store.invalidate();

        let err = store
            .find("", "", "", "/a", || Err(CacheError::Upstream("down".to_string())))
            .unwrap_err();
        assert_eq!(err, CacheError::Upstream("down".to_string()));
        assert!(store.policies().is_empty());
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            parse_policies("{\"policies\": 7}"),
            Err(CacheError::Upstream(_))
        ));
        assert!(parse_policies("{}").unwrap().is_empty());
    }
}
