use crate::error::GatewayError;
use async_trait::async_trait;
use exgate_core::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Timings and limits for the gateway, the `[gateway]` table of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Interval between liveness pings to browser clients, in seconds.
    pub ping_period_secs: u64,
    /// A client that stays silent this long is dropped, in seconds.
    pub pong_wait_secs: u64,
    /// Upper bound on an upstream WebSocket handshake, in seconds.
    pub dial_timeout_secs: u64,
    /// Timeout for exchange REST calls, in seconds.
    pub rest_timeout_secs: u64,
    /// How often an out-of-band stream token is renewed, in seconds.
    pub listen_key_renew_secs: u64,
    /// Reconnect attempts after an upstream read failure. 0 disables reconnect.
    pub reconnect_attempts: u32,
    /// First reconnect delay in milliseconds; doubles per attempt.
    pub reconnect_backoff_ms: u64,
    /// Cap on the reconnect delay in milliseconds.
    pub reconnect_backoff_max_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            ping_period_secs: 54,
            pong_wait_secs: 60,
            dial_timeout_secs: 10,
            rest_timeout_secs: 10,
            listen_key_renew_secs: 30 * 60,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1_000,
            reconnect_backoff_max_ms: 30_000,
        }
    }
}

impl GatewaySettings {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest_timeout_secs)
    }

    pub fn listen_key_renew(&self) -> Duration {
        Duration::from_secs(self.listen_key_renew_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .reconnect_backoff_ms
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max_ms);
        Duration::from_millis(ms)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.ping_period_secs == 0 {
            return Err(GatewayError::Config("ping_period_secs must be positive".into()));
        }
        if self.pong_wait_secs <= self.ping_period_secs {
            return Err(GatewayError::Config(
                "pong_wait_secs must exceed ping_period_secs".into(),
            ));
        }
        if self.dial_timeout_secs == 0 || self.rest_timeout_secs == 0 {
            return Err(GatewayError::Config("timeouts must be positive".into()));
        }
        if self.listen_key_renew_secs == 0 {
            return Err(GatewayError::Config(
                "listen_key_renew_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Endpoint overrides for one platform, the `[endpoints.<platform>]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverride {
    pub ws_url: Option<String>,
    pub rest_url: Option<String>,
    pub testnet_ws_url: Option<String>,
    pub testnet_rest_url: Option<String>,
}

/// Resolved endpoint table: built-in defaults with per-platform overrides.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    overrides: HashMap<Platform, EndpointOverride>,
}

impl EndpointTable {
    pub fn new(overrides: HashMap<Platform, EndpointOverride>) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, platform: Platform, testnet: bool) -> Endpoints {
        let mut endpoints = platform.default_endpoints(testnet);
        if let Some(o) = self.overrides.get(&platform) {
            let (ws, rest) = if testnet {
                (&o.testnet_ws_url, &o.testnet_rest_url)
            } else {
                (&o.ws_url, &o.rest_url)
            };
            if let Some(ws) = ws {
                endpoints.ws_url = ws.trim_end_matches('/').to_string();
            }
            if let Some(rest) = rest {
                endpoints.rest_url = rest.trim_end_matches('/').to_string();
            }
        }
        endpoints
    }
}

/// A static access token, the `[[tokens]]` array.
#[derive(Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
}

impl std::fmt::Debug for TokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEntry")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    #[serde(default)]
    pub credentials: Vec<CredentialRecord>,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointOverride>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig =
            toml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with. Credentials on unknown
    /// platforms are allowed here; `connect` rejects them per request.
    pub fn validate(&self) -> Result<(), GatewayError> {
        self.gateway.validate()?;

        let mut tokens = HashSet::new();
        for entry in &self.tokens {
            if entry.token.is_empty() || entry.user_id.is_empty() {
                return Err(GatewayError::Config("token entries need token and user_id".into()));
            }
            if !tokens.insert(entry.token.as_str()) {
                return Err(GatewayError::Config("duplicate token entry".into()));
            }
        }

        let mut ids = HashSet::new();
        for record in &self.credentials {
            if !ids.insert(record.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate credential id: {}",
                    record.id
                )));
            }
        }

        for name in self.endpoints.keys() {
            name.parse::<Platform>().map_err(GatewayError::Config)?;
        }
        Ok(())
    }

    pub fn endpoint_table(&self) -> Result<EndpointTable, GatewayError> {
        let overrides = self
            .endpoints
            .iter()
            .map(|(name, o)| Ok((name.parse::<Platform>().map_err(GatewayError::Config)?, o.clone())))
            .collect::<Result<HashMap<_, _>, GatewayError>>()?;
        Ok(EndpointTable::new(overrides))
    }

    pub fn token_validator(&self) -> StaticTokenValidator {
        StaticTokenValidator::new(self.tokens.iter().cloned())
    }

    pub fn credential_store(&self) -> ConfigCredentialStore {
        ConfigCredentialStore::new(self.credentials.iter().cloned())
    }
}

// ---------------------------------------------------------------------------
// File-backed collaborators
// ---------------------------------------------------------------------------

/// Accepts the tokens listed in the config file.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticTokenValidator {
    pub fn new(entries: impl IntoIterator<Item = TokenEntry>) -> Self {
        let tokens = entries
            .into_iter()
            .map(|e| {
                (
                    e.token,
                    UserIdentity {
                        user_id: e.user_id,
                        username: e.username,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

/// Serves the credential records listed in the config file.
#[derive(Debug, Default)]
pub struct ConfigCredentialStore {
    records: HashMap<String, CredentialRecord>,
}

impl ConfigCredentialStore {
    pub fn new(records: impl IntoIterator<Item = CredentialRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialStore for ConfigCredentialStore {
    async fn find(&self, id: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.records.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [gateway]
        ping_period_secs = 30
        pong_wait_secs = 40

        [[tokens]]
        token = "t-alice"
        user_id = "alice"

        [[credentials]]
        id = "k1"
        user_id = "alice"
        platform = "btcc"
        testnet = true
        api_key = "key"
        api_secret = "secret"

        [endpoints.btcc]
        testnet_ws_url = "ws://127.0.0.1:9001/"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.ping_period_secs, 30);
        assert_eq!(config.gateway.dial_timeout_secs, 10);
        assert_eq!(config.gateway.reconnect_attempts, 3);
        assert_eq!(config.tokens.len(), 1);
        assert!(config.credentials[0].active);

        let table = config.endpoint_table().unwrap();
        let endpoints = table.resolve(Platform::Btcc, true);
        assert_eq!(endpoints.ws_url, "ws://127.0.0.1:9001");
        assert_eq!(endpoints.rest_url, "https://api-testnet.btcc.com");
        assert_eq!(
            table.resolve(Platform::Binance, false),
            Platform::Binance.default_endpoints(false)
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.gateway.ping_period(), Duration::from_secs(54));
        assert_eq!(config.gateway.pong_wait(), Duration::from_secs(60));
        assert_eq!(config.gateway.listen_key_renew(), Duration::from_secs(1800));
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(GatewayConfig::from_toml_str("[gateway]\npong_wait_secs = 10").is_err());
        assert!(GatewayConfig::from_toml_str("[endpoints.kraken]\nws_url = \"ws://x\"").is_err());
        let dup = r#"
            [[credentials]]
            id = "k1"
            user_id = "a"
            platform = "btcc"
            api_key = "k"
            api_secret = "s"
            [[credentials]]
            id = "k1"
            user_id = "b"
            platform = "binance"
            api_key = "k"
            api_secret = "s"
        "#;
        assert!(GatewayConfig::from_toml_str(dup).is_err());
    }

    #[test]
    fn test_reconnect_delay_backoff() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.reconnect_delay(1), Duration::from_millis(1_000));
        assert_eq!(settings.reconnect_delay(2), Duration::from_millis(2_000));
        assert_eq!(settings.reconnect_delay(3), Duration::from_millis(4_000));
        assert_eq!(settings.reconnect_delay(10), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_static_collaborators() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        let validator = config.token_validator();
        let user = validator.validate("t-alice").await.unwrap();
        assert_eq!(user.user_id, "alice");
        assert!(matches!(
            validator.validate("nope").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            validator.validate("").await,
            Err(AuthError::MissingToken)
        ));

        let store = config.credential_store();
        assert!(store.find("k1").await.unwrap().is_some());
        assert!(store.find("k2").await.unwrap().is_none());
    }
}
