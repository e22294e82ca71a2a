//! Configuration management for the credential agent.
//!
//! The agent reads a single TOML document. Every section has defaults so a
//! minimal file only needs `[server] base_url`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sentinel used in config files for "never stale unless invalidated".
pub const INFINITE_REFRESH: i64 = -1;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("refresh interval must be >= 0 or -1 (infinite), got {0}")]
    RefreshInterval(i64),

    #[error("failed to serialize config: {0}")]
    Serialize(String),
}

/// How long a cached value stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RefreshInterval {
    /// Interval `0`: every lookup refetches.
    Always,
    /// Entries older than the duration are stale.
    Every(Duration),
    /// Never stale unless force-invalidated.
    Never,
}

impl RefreshInterval {
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Always
        } else {
            Self::Every(Duration::from_secs(secs))
        }
    }

    /// Whether an entry of the given age is past this interval.
    pub fn is_expired(&self, age: Duration) -> bool {
        match self {
            Self::Always => true,
            Self::Every(interval) => age >= *interval,
            Self::Never => false,
        }
    }
}

impl TryFrom<i64> for RefreshInterval {
    type Error = ConfigError;

    fn try_from(secs: i64) -> Result<Self, Self::Error> {
        match secs {
            INFINITE_REFRESH => Ok(Self::Never),
            s if s >= 0 => Ok(Self::from_secs(s as u64)),
            s => Err(ConfigError::RefreshInterval(s)),
        }
    }
}

impl From<RefreshInterval> for i64 {
    fn from(interval: RefreshInterval) -> Self {
        match interval {
            RefreshInterval::Always => 0,
            RefreshInterval::Every(d) => d.as_secs().min(i64::MAX as u64) as i64,
            RefreshInterval::Never => INFINITE_REFRESH,
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
///
/// Plain values precede the section tables so the struct serializes to a
/// valid TOML document.
pub struct AgentConfig {
    /// Seconds between ticks of the agent's update loop.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Poll interval while a CSR is waiting for its certificate.
    #[serde(default = "default_certificate_poll_interval")]
    pub certificate_poll_interval_secs: u64,
    pub server: ServerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Deployment topology of the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Central,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub topology: Topology,
    /// Status code an edge authority returns for an unknown identity key.
    #[serde(default = "default_no_device_status")]
    pub no_device_status_code: u16,
    /// Seconds the caller waits before re-running a failed operation.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

impl ServerConfig {
    /// Join the base URL with an endpoint path.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Endpoint paths relative to `base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub challenge: String,
    pub register: String,
    pub key: String,
    pub key_by_id: String,
    pub rotation_metadata: String,
    pub assets: String,
    pub asset_ack: String,
    pub csr: String,
    pub policies: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            challenge: "/api/v1/auth/challenge".to_string(),
            register: "/api/v1/auth/register".to_string(),
            key: "/api/v1/auth/key".to_string(),
            key_by_id: "/api/v1/auth/key-by-id".to_string(),
            rotation_metadata: "/api/v1/auth/rotation".to_string(),
            assets: "/api/v1/assets".to_string(),
            asset_ack: "/api/v1/assets/ack".to_string(),
            csr: "/api/v1/assets/csr".to_string(),
            policies: "/api/v1/policies".to_string(),
        }
    }
}

/// Which identity provider implementation to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process P-256 key (development and tests).
    #[default]
    Software,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub provider: ProviderKind,
    pub role: String,
    pub device_tid: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Software,
            role: "device".to_string(),
            device_tid: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Staleness and retry settings shared by the credential and policy caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: RefreshInterval,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl CacheConfig {
    pub fn new(refresh_interval: RefreshInterval, retry_interval: Duration) -> Self {
        Self {
            refresh_interval,
            retry_interval_secs: retry_interval.as_secs(),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheSection {
    pub credentials: CacheConfig,
    pub policies: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cert_dir: PathBuf,
    pub key_dir: PathBuf,
    /// Base64-encode the whole key envelope document before writing it.
    pub base64_envelope: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/var/lib/credagent/certs"),
            key_dir: PathBuf::from("/var/lib/credagent/keys"),
            base64_envelope: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AgentConfig {
    #[cfg(feature = "toml")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document that [`AgentConfig::from_toml_str`] accepts.
    #[cfg(feature = "toml")]
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerConfig {
                base_url: "https://localhost:8443".to_string(),
                endpoints: EndpointConfig::default(),
                user_agent: default_user_agent(),
                user_id: None,
                topology: Topology::Central,
                no_device_status_code: default_no_device_status(),
                retry_interval_secs: default_retry_interval(),
                request_timeout_secs: default_request_timeout(),
            },
            identity: IdentityConfig::default(),
            cache: CacheSection::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_secs: default_poll_interval(),
            certificate_poll_interval_secs: default_certificate_poll_interval(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.server.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "server.base_url",
                reason: format!("expected an http(s) URL, got {:?}", base),
            });
        }
        if self.server.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.user_agent",
                reason: "must not be empty".to_string(),
            });
        }
        if self.identity.role.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "identity.role",
                reason: "must not be empty".to_string(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn default_refresh_interval() -> RefreshInterval {
    RefreshInterval::Every(Duration::from_secs(3600))
}

fn default_user_agent() -> String {
    format!("credagent/{}", env!("CARGO_PKG_VERSION"))
}

fn default_no_device_status() -> u16 {
    404
}

fn default_retry_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    30
}

fn default_certificate_poll_interval() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_interval_sentinels() {
        assert_eq!(RefreshInterval::try_from(0).unwrap(), RefreshInterval::Always);
        assert_eq!(RefreshInterval::try_from(-1).unwrap(), RefreshInterval::Never);
        assert_eq!(
            RefreshInterval::try_from(30).unwrap(),
            RefreshInterval::Every(Duration::from_secs(30))
        );
        assert!(RefreshInterval::try_from(-5).is_err());
    }

    #[test]
    fn test_refresh_interval_expiry() {
        assert!(RefreshInterval::Always.is_expired(Duration::ZERO));
        assert!(!RefreshInterval::Never.is_expired(Duration::from_secs(u32::MAX as u64)));

        let every = RefreshInterval::from_secs(10);
        assert!(!every.is_expired(Duration::from_secs(9)));
        assert!(every.is_expired(Duration::from_secs(10)));
    }

    #[test]
    fn test_minimal_toml() {
        let config = AgentConfig::from_toml_str(
            r#"
            [server]
            base_url = "https://auth.example.com/"
            topology = "edge"

            [cache.credentials]
            refresh_interval = -1

            [cache.policies]
            refresh_interval = 0
            retry_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.topology, Topology::Edge);
        assert_eq!(config.cache.credentials.refresh_interval, RefreshInterval::Never);
        assert_eq!(config.cache.policies.refresh_interval, RefreshInterval::Always);
        assert_eq!(config.cache.policies.retry_interval(), Duration::from_secs(5));
        assert_eq!(
            config.server.url("/api/v1/auth/challenge"),
            "https://auth.example.com/api/v1/auth/challenge"
        );
        assert_eq!(config.identity.role, "device");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let result = AgentConfig::from_toml_str(
            r#"
            [server]
            base_url = "ftp://nope"
            "#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "server.base_url", .. })
        ));
    }

    #[test]
    fn test_default_config_toml_round_trip() {
        let mut config = AgentConfig::default_config();
        config.server.user_id = Some("operator-7".to_string());
        config
            .identity
            .metadata
            .insert("site".to_string(), "lab-2".to_string());
        config.cache.policies.refresh_interval = RefreshInterval::Never;

        let rendered = config.to_toml_string().unwrap();
        assert!(!rendered.trim_start().starts_with('{'));
        assert_eq!(AgentConfig::from_toml_str(&rendered).unwrap(), config);

        let defaults = AgentConfig::default_config();
        let rendered = defaults.to_toml_string().unwrap();
        assert_eq!(AgentConfig::from_toml_str(&rendered).unwrap(), defaults);
    }

    #[test]
    fn test_default_config_is_valid() {
        AgentConfig::default_config().validate().unwrap();
    }
}
