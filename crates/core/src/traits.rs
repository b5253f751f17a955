use crate::events::*;
use crate::models::*;
use async_trait::async_trait;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Adapter Trait
// ---------------------------------------------------------------------------

/// Errors raised while building or interpreting exchange traffic.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Unsupported stream: {0}")]
    UnsupportedStream(String),
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("REST error: {0}")]
    Rest(String),
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Parse(e.to_string())
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        AdapterError::Rest(e.to_string())
    }
}

/// A raw upstream frame handed to an adapter.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// What an adapter wants put on the wire for one subscription change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRequest {
    /// A stream name that becomes part of the socket URL.
    Stream(String),
    /// A correlated request frame.
    Rpc { id: u64, text: String },
    /// Nothing to send (the stream is implied by the socket itself).
    None,
}

/// One item decoded from an upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message ready for fan-out.
    Message(NormalizedMessage),
    /// The answer to a request this side sent.
    Response { id: u64, error: Option<String> },
}

/// Translates between the gateway's normalized model and one exchange's wire protocol.
///
/// One adapter instance is chosen per exchange connection; adapters hold no
/// per-connection state (request ids and pending requests live in the connection).
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn style(&self) -> ProtocolStyle;

    /// Normalize a client request into a subscription key.
    fn format_key(
        &self,
        stream: StreamType,
        symbol: &str,
        param: Option<&str>,
    ) -> Result<SubscriptionKey, AdapterError>;

    fn build_subscribe(&self, key: &SubscriptionKey, id: u64) -> Result<WireRequest, AdapterError>;

    fn build_unsubscribe(&self, key: &SubscriptionKey, id: u64)
        -> Result<WireRequest, AdapterError>;

    /// Decode a frame. Unknown or irrelevant frames yield nothing.
    fn parse_inbound(&self, frame: Frame<'_>) -> Vec<Inbound>;

    /// URL of the public socket carrying `streams` (stateless) or of the RPC socket.
    fn public_url(&self, endpoints: &Endpoints, streams: &[String]) -> String;

    /// URL of the private socket. `token` is the out-of-band stream token, if any.
    fn private_url(&self, endpoints: &Endpoints, token: Option<&str>) -> String;

    /// In-band authentication frame, for protocols that authenticate on the socket.
    fn build_auth(&self, _credentials: &CredentialSet, _id: u64) -> Option<String> {
        None
    }

    /// Application-level keepalive frame.
    fn build_ping(&self, _id: u64) -> Option<String> {
        None
    }

    /// How often `build_ping` should be sent.
    fn keepalive_interval(&self) -> Option<Duration> {
        None
    }

    /// Obtain an out-of-band stream token for private streams.
    async fn open_private_stream(
        &self,
        _http: &reqwest::Client,
        _credentials: &CredentialSet,
    ) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }

    /// Keep an out-of-band stream token alive.
    async fn renew_private_stream(
        &self,
        _http: &reqwest::Client,
        _credentials: &CredentialSet,
        _token: &str,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Release an out-of-band stream token.
    async fn close_private_stream(
        &self,
        _http: &reqwest::Client,
        _credentials: &CredentialSet,
        _token: &str,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborator Traits
// ---------------------------------------------------------------------------

/// Errors from access-token validation.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing access token")]
    MissingToken,
    #[error("Invalid access token")]
    InvalidToken,
    #[error("Auth backend error: {0}")]
    Backend(String),
}

/// Exchanges an access token for a user identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserIdentity, AuthError>;
}

/// Errors from the credential repository.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Looks up stored exchange credentials by id.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<CredentialRecord>, StoreError>;
}
