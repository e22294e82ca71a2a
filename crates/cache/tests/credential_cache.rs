use std::sync::Arc;
use std::time::Duration;

use credagent_cache::{CacheError, CredentialCache, Lookup, ManualClock};
use credagent_core::testutil::ScriptedTransport;
use credagent_core::{AgentConfig, CacheConfig, NoopEventSink, RefreshInterval};
use credagent_crypto::{encode_b64, encrypt, CryptoError, KeyResolver};
use credagent_identity::{AuthenticationEngine, SoftwareIdentityProvider};

const AUTH_KEY: [u8; 32] = [0x31; 32];
const AUTH_IV: [u8; 16] = [0x41; 16];

fn setup(interval: RefreshInterval) -> (CredentialCache, Arc<ScriptedTransport>, Arc<ManualClock>) {
    let config = AgentConfig::default_config();
    let transport = Arc::new(ScriptedTransport::new());
    let engine = Arc::new(AuthenticationEngine::new(
        config.server,
        config.identity,
        transport.clone(),
        Arc::new(SoftwareIdentityProvider::generate(None)),
        Arc::new(NoopEventSink),
    ));
    let clock = Arc::new(ManualClock::new());
    let cache = CredentialCache::with_clock(
        engine,
        CacheConfig::new(interval, Duration::from_secs(60)),
        clock.clone(),
    );
    (cache, transport, clock)
}

fn script_auth(transport: &ScriptedTransport, key_id: &str) {
    transport
        .push_ok(
            "/auth/challenge",
            r#"{"challenge":"nonce","registered":true}"#,
        )
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
fn current_credential_is_fetched_once_until_stale() {
    let (cache, transport, clock) = setup(RefreshInterval::from_secs(600));
    script_auth(&transport, "kid-a");
    script_auth(&transport, "kid-b");

    assert_eq!(cache.current(Some("pol")).unwrap().key_id(), "kid-a");
    assert_eq!(cache.current(Some("pol")).unwrap().key_id(), "kid-a");
    assert_eq!(transport.calls_to("/auth/challenge"), 1);

    clock.advance(Duration::from_secs(601));
    assert_eq!(cache.current(Some("pol")).unwrap().key_id(), "kid-b");
    assert_eq!(transport.calls_to("/auth/challenge"), 2);
}

#[test]
fn policies_are_cached_separately() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    script_auth(&transport, "kid-1");
    script_auth(&transport, "kid-2");

    cache.current(Some("pol-1")).unwrap();
    cache.current(Some("pol-2")).unwrap();
    assert_eq!(transport.calls_to("/auth/challenge"), 2);
}

#[test]
fn unknown_key_id_is_cached_as_not_found() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    script_auth(&transport, "kid-auth");
    transport.push_status("/auth/key-by-id", 404, "");

    for _ in 0..4 {
        assert_eq!(cache.get(Some("kid-gone"), None).unwrap(), Lookup::NotFound);
    }
    assert_eq!(transport.calls_to("/auth/key-by-id"), 1);
    assert_eq!(transport.remaining(), 0);
}

#[test]
fn rejected_key_request_maps_to_not_allowed() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    transport
        .push_ok(
            "/auth/challenge",
            r#"{"challenge":"nonce","registered":true}"#,
        )
        .push_status("/auth/key", 403, r#"{"message":"revoked"}"#);

    assert_eq!(
        cache.get(None, None).unwrap_err(),
        CacheError::NotAllowed("revoked".to_string())
    );
    assert!(cache.is_empty());
}

#[test]
fn resolver_refreshes_known_key_by_id() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    let old_key = [0x77u8; 32];
    let old_iv = [0x88u8; 16];
    script_auth(&transport, "kid-auth");
    transport.push_ok(
        "/auth/key-by-id",
        serde_json::json!({
            "keyId": "kid-old",
            "key": encode_b64(&encrypt(&old_key, &AUTH_KEY, &AUTH_IV).unwrap()),
            "iv": encode_b64(&encrypt(&old_iv, &AUTH_KEY, &AUTH_IV).unwrap()),
        })
        .to_string(),
    );

    let credential = cache.resolve("kid-old").unwrap();
    assert_eq!(credential.key(), &old_key);
    assert_eq!(credential.iv(), &old_iv);

    // Served from cache now
    assert_eq!(cache.resolve("kid-old").unwrap(), credential);
    assert_eq!(transport.remaining(), 0);
}

#[test]
fn current_credential_resolves_by_its_own_id() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    script_auth(&transport, "kid-now");

    let current = cache.current(None).unwrap();
    let resolved = cache.resolve("kid-now").unwrap();
    assert_eq!(current, resolved);
    assert_eq!(transport.requests().len(), 2);
}

#[test]
fn policy_credential_resolves_by_its_own_id() {
    let (cache, transport, _) = setup(RefreshInterval::from_secs(600));
    script_auth(&transport, "kid-pol");

    let current = cache.current(Some("pol")).unwrap();
    assert_eq!(cache.resolve("kid-pol").unwrap(), current);
    assert_eq!(
        cache.get(Some("kid-pol"), Some("pol")).unwrap(),
        Lookup::Found(current)
    );
    assert_eq!(transport.calls_to("/auth/challenge"), 1);
    assert_eq!(transport.calls_to("/auth/key-by-id"), 0);
    assert_eq!(transport.remaining(), 0);
}

#[test]
fn resolver_reports_unavailable_on_failure() {
    let (cache, _transport, _) = setup(RefreshInterval::from_secs(600));
    // Empty script: the challenge request fails to connect
    assert!(matches!(
        cache.resolve("kid-x"),
        Err(CryptoError::KeyUnavailable(_))
    ));
}

#[test]
fn invalidate_forces_reauthentication() {
    let (cache, transport, _) = setup(RefreshInterval::Never);
    script_auth(&transport, "kid-1");
    script_auth(&transport, "kid-2");

    cache.current(None).unwrap();
    assert!(cache.invalidate(None, None));
    assert_eq!(cache.current(None).unwrap().key_id(), "kid-2");
}
