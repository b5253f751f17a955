use crate::models::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Outbound (gateway -> client)
// ---------------------------------------------------------------------------

/// Type tag carried by every message sent to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Connected,
    Kline,
    Orderbook,
    Order,
    Trades,
    Asset,
    State,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Connected => "connected",
            MessageType::Kline => "kline",
            MessageType::Orderbook => "orderbook",
            MessageType::Order => "order",
            MessageType::Trades => "trades",
            MessageType::Asset => "asset",
            MessageType::State => "state",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// The only shape ever written to a client socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: serde_json::Value,
    pub platform: String,
    pub symbol: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NormalizedMessage {
    /// Build a data message. Payloads that fail to serialize become `null`.
    pub fn new(
        kind: MessageType,
        platform: Platform,
        symbol: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        Self {
            kind,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            platform: platform.to_string(),
            symbol: symbol.into(),
            timestamp: now_millis(),
            error: None,
        }
    }

    /// Build an error message. `platform` is empty when no exchange is involved.
    pub fn error(platform: Option<Platform>, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            data: serde_json::Value::Null,
            platform: platform.map(|p| p.to_string()).unwrap_or_default(),
            symbol: String::new(),
            timestamp: now_millis(),
            error: Some(message.into()),
        }
    }

    pub fn connected(platform: Option<Platform>, data: serde_json::Value) -> Self {
        Self {
            kind: MessageType::Connected,
            data,
            platform: platform.map(|p| p.to_string()).unwrap_or_default(),
            symbol: String::new(),
            timestamp: now_millis(),
            error: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = symbol.into();
        self
    }

    pub fn to_json(&self) -> String {
        // A struct of strings, numbers and a Value cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Normalized payloads
// ---------------------------------------------------------------------------

/// One candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineData {
    /// Bar open time, epoch milliseconds.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    pub open: String,
    pub close: String,
    pub high: String,
    pub low: String,
    pub volume: String,
    pub amount: String,
}

/// `[price, quantity]`
pub type PriceLevel = [String; 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookData {
    /// `true` for a full book, `false` for an incremental update.
    pub snapshot: bool,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "bestBid", default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<PriceLevel>,
    #[serde(rename = "bestAsk", default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<PriceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub id: String,
    pub price: String,
    pub amount: String,
    /// "BUY" or "SELL" (taker side).
    pub side: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderData {
    #[serde(rename = "orderId")]
    pub order_id: String,
    /// "BUY" or "SELL".
    pub side: String,
    /// "LIMIT", "MARKET", ...
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub status: String,
    pub price: String,
    pub amount: String,
    pub filled: String,
    #[serde(rename = "createTime")]
    pub create_time: i64,
    #[serde(rename = "updateTime")]
    pub update_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub available: String,
    pub frozen: String,
}

/// Balances keyed by currency.
pub type AssetData = BTreeMap<String, AssetBalance>;

/// 24h market state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub last: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub volume: String,
    pub amount: String,
}

// ---------------------------------------------------------------------------
// Inbound (client -> gateway)
// ---------------------------------------------------------------------------

/// Stream request carried by `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamRequest {
    #[serde(rename = "type")]
    pub stream: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Connect { api_key_id: String },
    Subscribe(StreamRequest),
    Unsubscribe(StreamRequest),
}

/// Why a client frame could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("invalid message format: {0}")]
    Malformed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid {action} request: {reason}")]
    Invalid { action: String, reason: String },
}

#[derive(Deserialize)]
struct ConnectArgs {
    #[serde(rename = "apiKeyId")]
    api_key_id: String,
}

impl ClientCommand {
    /// Parse a text frame. Unknown actions are reported separately from bad JSON.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
        let action = value
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| CommandError::Malformed("missing action".to_string()))?
            .to_string();

        let invalid = |e: serde_json::Error| CommandError::Invalid {
            action: action.clone(),
            reason: e.to_string(),
        };

        match action.as_str() {
            "connect" => {
                let args: ConnectArgs = serde_json::from_value(value.clone()).map_err(invalid)?;
                Ok(ClientCommand::Connect {
                    api_key_id: args.api_key_id,
                })
            }
            "subscribe" => Ok(ClientCommand::Subscribe(
                serde_json::from_value(value.clone()).map_err(invalid)?,
            )),
            "unsubscribe" => Ok(ClientCommand::Unsubscribe(
                serde_json::from_value(value.clone()).map_err(invalid)?,
            )),
            _ => Err(CommandError::UnknownAction(action.clone())),
        }
    }
}
