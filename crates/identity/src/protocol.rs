//! JSON messages exchanged with the authority.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `nextAction` value asking the device to register first.
pub const NEXT_ACTION_REGISTER: &str = "register";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub device_key: serde_json::Value,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChallengeResponse {
    pub next_action: Option<String>,
    pub challenge: Option<String>,
    pub registered: Option<bool>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
}

impl ChallengeResponse {
    pub fn requires_registration(&self) -> bool {
        self.next_action
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(NEXT_ACTION_REGISTER))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub device_key: serde_json::Value,
    pub device_tid: String,
    pub role: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    pub registered: Option<bool>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRequest {
    pub device_key: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_hash: Option<String>,
    /// `appHash` carries an HMAC under the signing key rather than the raw hash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_hash_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyByIdRequest {
    /// Key id negotiated by the authentication round trip
    pub key_id: String,
    pub requested_key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

/// `{keyId, key, iv}`; key and iv are base64.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub key_id: String,
    pub key: String,
    pub iv: String,
}

/// Error body shape shared by every endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub message: Option<String>,
    pub status_code: Option<u16>,
}

impl ServerMessage {
    /// Best-effort parse; a non-JSON body becomes the message itself.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<ServerMessage>(body) {
            Ok(msg) => msg,
            Err(_) if body.trim().is_empty() => Self::default(),
            Err(_) => Self {
                message: Some(body.trim().to_string()),
                status_code: None,
            },
        }
    }

    pub fn message_or(&self, fallback: &str) -> String {
        self.message.clone().unwrap_or_else(|| fallback.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_response_variants() {
        let register: ChallengeResponse =
            serde_json::from_str(r#"{"nextAction":"register"}"#).unwrap();
        assert!(register.requires_registration());

        let challenge: ChallengeResponse =
            serde_json::from_str(r#"{"challenge":"abc","registered":true}"#).unwrap();
        assert!(!challenge.requires_registration());
        assert_eq!(challenge.challenge.as_deref(), Some("abc"));
    }

    #[test]
    fn test_key_request_omits_absent_fields() {
        let req = KeyRequest {
            device_key: serde_json::json!({"k": 1}),
            policy_id: None,
            asset_id: Some("a-1".to_string()),
            app_hash: None,
            app_hash_key_id: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["assetId"], "a-1");
        assert!(value.get("appHash").is_none());
        assert!(value.get("policyId").is_none());
    }

    #[test]
    fn test_server_message_parse() {
        let msg = ServerMessage::parse(r#"{"message":"denied","statusCode":403}"#);
        assert_eq!(msg.message.as_deref(), Some("denied"));
        assert_eq!(msg.status_code, Some(403));

        let plain = ServerMessage::parse("gateway timeout");
        assert_eq!(plain.message.as_deref(), Some("gateway timeout"));
        assert_eq!(ServerMessage::parse("").message_or("none"), "none");
    }
}
