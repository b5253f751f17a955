use exgate_core::{AdapterError, AuthError, CommandError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not connected, call connect first")]
    NotConnected,
    #[error("api key not found")]
    CredentialNotFound,
    #[error("api key does not belong to this user")]
    CredentialForbidden,
    #[error("api key is inactive")]
    CredentialInactive,
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid message format: {0}")]
    Malformed(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("service unavailable")]
    Closed,
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
    #[error("dial {target} failed: {reason}")]
    Dial { target: String, reason: String },
    #[error("dial {0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<CommandError> for GatewayError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Malformed(reason) => GatewayError::Malformed(reason),
            CommandError::UnknownAction(action) => GatewayError::UnknownAction(action),
            invalid @ CommandError::Invalid { .. } => GatewayError::InvalidRequest(invalid.to_string()),
        }
    }
}

/// Scheme and authority of a URL, for logs and errors. Paths can carry
/// stream tokens.
pub fn redact_url(url: &str) -> String {
    let start = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[start..].find(['/', '?']) {
        Some(end) => url[..start + end].to_string(),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("wss://stream.binance.com:9443/ws/secretlistenkey"),
            "wss://stream.binance.com:9443"
        );
        assert_eq!(
            redact_url("ws://127.0.0.1:9000?streams=a"),
            "ws://127.0.0.1:9000"
        );
        assert_eq!(redact_url("ws://localhost"), "ws://localhost");
    }

    #[test]
    fn test_command_errors_map() {
        let err: GatewayError = CommandError::Malformed("eof".to_string()).into();
        assert_eq!(err.to_string(), "invalid message format: eof");
        let err: GatewayError = CommandError::UnknownAction("dance".to_string()).into();
        assert_eq!(err.to_string(), "unknown action: dance");
    }
}
