use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Platforms
// ---------------------------------------------------------------------------

/// An exchange the gateway knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Binance,
    Btcc,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Binance, Platform::Btcc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Binance => "binance",
            Platform::Btcc => "btcc",
        }
    }

    /// Built-in endpoints for the production or testnet environment.
    pub fn default_endpoints(&self, testnet: bool) -> Endpoints {
        let (ws_url, rest_url) = match (self, testnet) {
            (Platform::Binance, false) => (
                "wss://stream.binance.com:9443",
                "https://api.binance.com",
            ),
            (Platform::Binance, true) => (
                "wss://stream.testnet.binance.vision",
                "https://testnet.binance.vision",
            ),
            (Platform::Btcc, false) => ("wss://ws.btcc.com/ws", "https://api.btcc.com"),
            (Platform::Btcc, true) => (
                "wss://ws-testnet.btcc.com/ws",
                "https://api-testnet.btcc.com",
            ),
        };
        Endpoints {
            ws_url: ws_url.to_string(),
            rest_url: rest_url.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Platform::Binance),
            "btcc" => Ok(Platform::Btcc),
            other => Err(format!("unsupported platform: {}", other)),
        }
    }
}

/// How an exchange expects its subscription set to be expressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStyle {
    /// The stream set is part of the socket URL; changing it means redialing.
    StatelessReconnect,
    /// One long-lived socket carrying correlated requests and pushes.
    PersistentRpc,
}

/// Base URLs for one (platform, environment) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub ws_url: String,
    pub rest_url: String,
}

// ---------------------------------------------------------------------------
// Identities & credentials
// ---------------------------------------------------------------------------

/// The user behind an accepted access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: Option<String>,
}

/// A credential row as stored, before platform resolution.
#[derive(Clone, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    #[serde(default)]
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("testnet", &self.testnet)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// A resolved, immutable credential set used by one exchange connection.
///
/// Never serialized; `Debug` leaves the secret out.
#[derive(Clone)]
pub struct CredentialSet {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,
    pub endpoints: Endpoints,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("testnet", &self.testnet)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// The kind of upstream stream a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Kline,
    Orderbook,
    Trades,
    Orders,
    Asset,
    State,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Kline => "kline",
            StreamType::Orderbook => "orderbook",
            StreamType::Trades => "trades",
            StreamType::Orders => "orders",
            StreamType::Asset => "asset",
            StreamType::State => "state",
        }
    }

    /// Account streams ride the authenticated socket.
    pub fn is_private(&self) -> bool {
        matches!(self, StreamType::Orders | StreamType::Asset)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kline" => Ok(StreamType::Kline),
            "orderbook" => Ok(StreamType::Orderbook),
            "trades" => Ok(StreamType::Trades),
            "orders" => Ok(StreamType::Orders),
            "asset" => Ok(StreamType::Asset),
            "state" => Ok(StreamType::State),
            other => Err(format!("unknown subscription type: {}", other)),
        }
    }
}

/// Normalized identifier for one upstream stream.
///
/// Two clients asking for the same key share one upstream subscription.
/// The canonical string form is `stream:SYMBOL[:param]`, or just `stream`
/// for symbol-less streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub stream: StreamType,
    pub symbol: String,
    pub param: Option<String>,
}

impl SubscriptionKey {
    pub fn new(stream: StreamType, symbol: impl Into<String>, param: Option<String>) -> Self {
        Self {
            stream,
            symbol: symbol.into(),
            param,
        }
    }

    pub fn is_private(&self) -> bool {
        self.stream.is_private()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream.as_str())?;
        if !self.symbol.is_empty() {
            write!(f, ":{}", self.symbol)?;
        }
        if let Some(param) = &self.param {
            write!(f, ":{}", param)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = SubscriptionKey::new(StreamType::Kline, "BTCUSDT", Some("1m".to_string()));
        assert_eq!(key.to_string(), "kline:BTCUSDT:1m");

        let key = SubscriptionKey::new(StreamType::Asset, "", None);
        assert_eq!(key.to_string(), "asset");
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Binance".parse::<Platform>(), Ok(Platform::Binance));
        assert_eq!("btcc".parse::<Platform>(), Ok(Platform::Btcc));
        assert!("kraken".parse::<Platform>().is_err());
    }

    #[test]
    fn test_private_streams() {
        assert!(StreamType::Orders.is_private());
        assert!(StreamType::Asset.is_private());
        assert!(!StreamType::State.is_private());
        assert!("candles".parse::<StreamType>().is_err());
    }

    #[test]
    fn test_secret_not_in_debug() {
        let creds = CredentialSet {
            id: "k1".to_string(),
            user_id: "u1".to_string(),
            platform: Platform::Btcc,
            testnet: false,
            api_key: "key".to_string(),
            api_secret: "super-secret".to_string(),
            endpoints: Platform::Btcc.default_endpoints(false),
        };
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }
}
