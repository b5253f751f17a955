//! BTCC spot stream adapter.
//!
//! BTCC speaks a JSON-RPC dialect over one long-lived socket: requests carry a
//! numeric id, responses echo it, and pushes arrive with a method name and no
//! id. Account streams need an `accessid_auth` handshake on a dedicated
//! socket. Frames may be sent as raw-deflate compressed binary.

pub mod parser;
pub mod protocol;

use async_trait::async_trait;
use exgate_core::*;
use exgate_exchanges_common::inflate_raw;
use std::time::Duration;
use tracing::debug;

/// Keepalive period for the `ping` request.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Persistent-RPC adapter for BTCC.
#[derive(Debug, Default, Clone, Copy)]
pub struct BtccAdapter;

impl BtccAdapter {
    pub fn new() -> Self {
        Self
    }

    fn decode(frame: Frame<'_>) -> Option<protocol::RpcFrame> {
        let parsed = match frame {
            Frame::Text(text) => serde_json::from_str(text),
            Frame::Binary(bytes) => inflate_raw(bytes)
                .ok()
                .and_then(|inflated| serde_json::from_slice(&inflated).ok())
                .map(Ok)
                // Some frames arrive as plain JSON in a binary envelope.
                .unwrap_or_else(|| serde_json::from_slice(bytes)),
        };
        match parsed {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!(error = %e, "Dropping undecodable BTCC frame");
                None
            }
        }
    }
}

#[async_trait]
impl ProtocolAdapter for BtccAdapter {
    fn platform(&self) -> Platform {
        Platform::Btcc
    }

    fn style(&self) -> ProtocolStyle {
        ProtocolStyle::PersistentRpc
    }

    fn format_key(
        &self,
        stream: StreamType,
        symbol: &str,
        param: Option<&str>,
    ) -> Result<SubscriptionKey, AdapterError> {
        protocol::format_key(stream, symbol, param)
    }

    fn build_subscribe(&self, key: &SubscriptionKey, id: u64) -> Result<WireRequest, AdapterError> {
        Ok(WireRequest::Rpc {
            id,
            text: protocol::subscribe(key, id)?,
        })
    }

    fn build_unsubscribe(
        &self,
        key: &SubscriptionKey,
        id: u64,
    ) -> Result<WireRequest, AdapterError> {
        Ok(WireRequest::Rpc {
            id,
            text: protocol::unsubscribe(key, id)?,
        })
    }

    fn parse_inbound(&self, frame: Frame<'_>) -> Vec<Inbound> {
        Self::decode(frame)
            .map(parser::parse_frame)
            .unwrap_or_default()
    }

    fn public_url(&self, endpoints: &Endpoints, _streams: &[String]) -> String {
        endpoints.ws_url.clone()
    }

    fn private_url(&self, endpoints: &Endpoints, _token: Option<&str>) -> String {
        endpoints.ws_url.clone()
    }

    fn build_auth(&self, credentials: &CredentialSet, id: u64) -> Option<String> {
        Some(protocol::auth(credentials, id))
    }

    fn build_ping(&self, id: u64) -> Option<String> {
        Some(protocol::ping(id))
    }

    fn keepalive_interval(&self) -> Option<Duration> {
        Some(KEEPALIVE_INTERVAL)
    }
}
