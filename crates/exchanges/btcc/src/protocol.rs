//! BTCC JSON-RPC wire types and request builders.

use exgate_core::{AdapterError, CredentialSet, StreamType, SubscriptionKey};
use exgate_exchanges_common::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_INTERVAL: &str = "1m";
pub const DEFAULT_DEPTH: &str = "20";
pub const DEPTHS: [&str; 4] = ["5", "10", "20", "50"];

/// An outbound request: `{"id":n,"method":"...","params":[...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Vec<Value>,
}

impl RpcRequest<'_> {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Any inbound frame: a response (id set) or a push (id null, method set).
#[derive(Debug, Clone, Deserialize)]
pub struct RpcFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Kline interval label to period seconds.
pub fn interval_seconds(interval: &str) -> Option<u64> {
    let secs = match interval {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h" => 3_600,
        "2h" => 7_200,
        "4h" => 14_400,
        "6h" => 21_600,
        "12h" => 43_200,
        "1d" => 86_400,
        "1w" => 604_800,
        _ => return None,
    };
    Some(secs)
}

pub fn format_key(
    stream: StreamType,
    symbol: &str,
    param: Option<&str>,
) -> Result<SubscriptionKey, AdapterError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    let needs_symbol = !matches!(stream, StreamType::Asset | StreamType::Orders);
    if needs_symbol && symbol.is_empty() {
        return Err(AdapterError::InvalidSymbol(format!(
            "{} requires a symbol",
            stream
        )));
    }

    let param = match stream {
        StreamType::Kline => {
            let interval = param.unwrap_or(DEFAULT_INTERVAL);
            if interval_seconds(interval).is_none() {
                return Err(AdapterError::InvalidInterval(interval.to_string()));
            }
            Some(interval.to_string())
        }
        StreamType::Orderbook => {
            let depth = param.unwrap_or(DEFAULT_DEPTH);
            if !DEPTHS.contains(&depth) {
                return Err(AdapterError::UnsupportedStream(format!(
                    "order book depth {}",
                    depth
                )));
            }
            Some(depth.to_string())
        }
        _ => None,
    };

    let symbol = if stream == StreamType::Asset {
        String::new()
    } else {
        symbol
    };
    Ok(SubscriptionKey::new(stream, symbol, param))
}

/// Wire resource name and parameters for a key.
fn resource(key: &SubscriptionKey) -> Result<(&'static str, Vec<Value>), AdapterError> {
    let symbol = Value::String(key.symbol.clone());
    let resource = match key.stream {
        StreamType::Kline => {
            let interval = key.param.as_deref().unwrap_or(DEFAULT_INTERVAL);
            let secs = interval_seconds(interval)
                .ok_or_else(|| AdapterError::InvalidInterval(interval.to_string()))?;
            ("kline", vec![symbol, json!(secs)])
        }
        StreamType::Orderbook => {
            let depth: u32 = key
                .param
                .as_deref()
                .unwrap_or(DEFAULT_DEPTH)
                .parse()
                .map_err(|_| AdapterError::UnsupportedStream(key.to_string()))?;
            ("depth", vec![symbol, json!(depth), json!("0")])
        }
        StreamType::Trades => ("deals", vec![symbol]),
        StreamType::State => ("state", vec![symbol]),
        StreamType::Orders if key.symbol.is_empty() => ("order", Vec::new()),
        StreamType::Orders => ("order", vec![symbol]),
        StreamType::Asset => ("asset", Vec::new()),
    };
    Ok(resource)
}

pub fn subscribe(key: &SubscriptionKey, id: u64) -> Result<String, AdapterError> {
    let (resource, params) = resource(key)?;
    let method = format!("{}.subscribe", resource);
    Ok(RpcRequest {
        id,
        method: &method,
        params,
    }
    .to_text())
}

pub fn unsubscribe(key: &SubscriptionKey, id: u64) -> Result<String, AdapterError> {
    let (resource, params) = resource(key)?;
    let method = format!("{}.unsubscribe", resource);
    Ok(RpcRequest {
        id,
        method: &method,
        params,
    }
    .to_text())
}

/// `accessid_auth` with the API key and the SHA-256 of the secret.
pub fn auth(credentials: &CredentialSet, id: u64) -> String {
    RpcRequest {
        id,
        method: "accessid_auth",
        params: vec![
            json!(credentials.api_key),
            json!(sha256_hex(&credentials.api_secret)),
        ],
    }
    .to_text()
}

pub fn ping(id: u64) -> String {
    RpcRequest {
        id,
        method: "ping",
        params: Vec::new(),
    }
    .to_text()
}
