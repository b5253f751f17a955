//! Binance spot stream adapter.
//!
//! Binance is a stateless-reconnect exchange: the public stream set is part
//! of the socket URL, so any change to it means dialing a new socket. Account
//! events arrive on a separate user-data socket addressed by a listen key that
//! is obtained (and periodically extended) over REST.

pub mod parser;
pub mod rest;
pub mod streams;

use async_trait::async_trait;
use exgate_core::*;

/// Stateless-reconnect adapter for Binance.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinanceAdapter;

impl BinanceAdapter {
    pub fn new() -> Self {
        Self
    }

    fn wire(key: &SubscriptionKey) -> WireRequest {
        match streams::stream_name(key) {
            Some(name) => WireRequest::Stream(name),
            // The user-data socket carries every account event.
            None => WireRequest::None,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for BinanceAdapter {
    fn platform(&self) -> Platform {
        Platform::Binance
    }

    fn style(&self) -> ProtocolStyle {
        ProtocolStyle::StatelessReconnect
    }

    fn format_key(
        &self,
        stream: StreamType,
        symbol: &str,
        param: Option<&str>,
    ) -> Result<SubscriptionKey, AdapterError> {
        streams::format_key(stream, symbol, param)
    }

    fn build_subscribe(&self, key: &SubscriptionKey, _id: u64) -> Result<WireRequest, AdapterError> {
        Ok(Self::wire(key))
    }

    fn build_unsubscribe(
        &self,
        key: &SubscriptionKey,
        _id: u64,
    ) -> Result<WireRequest, AdapterError> {
        Ok(Self::wire(key))
    }

    fn parse_inbound(&self, frame: Frame<'_>) -> Vec<Inbound> {
        let parsed = match frame {
            Frame::Text(text) => serde_json::from_str::<serde_json::Value>(text),
            Frame::Binary(bytes) => serde_json::from_slice::<serde_json::Value>(bytes),
        };
        match parsed {
            Ok(value) => parser::parse_value(&value),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping non-JSON Binance frame");
                Vec::new()
            }
        }
    }

    fn public_url(&self, endpoints: &Endpoints, streams: &[String]) -> String {
        streams::combined_url(endpoints, streams)
    }

    fn private_url(&self, endpoints: &Endpoints, token: Option<&str>) -> String {
        streams::user_stream_url(endpoints, token.unwrap_or_default())
    }

    async fn open_private_stream(
        &self,
        http: &reqwest::Client,
        credentials: &CredentialSet,
    ) -> Result<Option<String>, AdapterError> {
        let key =
            rest::create_listen_key(http, &credentials.endpoints.rest_url, &credentials.api_key)
                .await?;
        Ok(Some(key))
    }

    async fn renew_private_stream(
        &self,
        http: &reqwest::Client,
        credentials: &CredentialSet,
        token: &str,
    ) -> Result<(), AdapterError> {
        rest::keepalive_listen_key(
            http,
            &credentials.endpoints.rest_url,
            &credentials.api_key,
            token,
        )
        .await
    }

    async fn close_private_stream(
        &self,
        http: &reqwest::Client,
        credentials: &CredentialSet,
        token: &str,
    ) -> Result<(), AdapterError> {
        rest::close_listen_key(
            http,
            &credentials.endpoints.rest_url,
            &credentials.api_key,
            token,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_requests() {
        let adapter = BinanceAdapter::new();
        let key = adapter
            .format_key(StreamType::Trades, "btcusdt", None)
            .unwrap();
        assert_eq!(
            adapter.build_subscribe(&key, 1).unwrap(),
            WireRequest::Stream("btcusdt@trade".to_string())
        );

        let key = adapter.format_key(StreamType::Asset, "", None).unwrap();
        assert_eq!(adapter.build_unsubscribe(&key, 2).unwrap(), WireRequest::None);
    }

    #[test]
    fn test_binary_frame_as_json() {
        let adapter = BinanceAdapter::new();
        let text = r#"{"e":"trade","s":"BTCUSDT","t":1,"p":"1","q":"1","T":5,"m":false}"#;
        let from_text = adapter.parse_inbound(Frame::Text(text));
        let from_binary = adapter.parse_inbound(Frame::Binary(text.as_bytes()));
        assert_eq!(from_text.len(), 1);
        assert_eq!(from_binary.len(), 1);
        match (&from_text[0], &from_binary[0]) {
            (Inbound::Message(a), Inbound::Message(b)) => {
                assert_eq!(a.data, b.data);
                assert_eq!(a.symbol, b.symbol);
            }
            other => panic!("Expected messages, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_dropped() {
        let adapter = BinanceAdapter::new();
        assert!(adapter.parse_inbound(Frame::Text("not json")).is_empty());
    }
}
