use crate::adapters::adapter_for;
use crate::config::{EndpointTable, GatewaySettings};
use crate::connection::ExchangeConnection;
use crate::error::GatewayError;
use crate::session::{ClientSession, SessionId};
use axum::extract::ws::Message;
use exgate_core::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Registry {
    closed: bool,
    sessions: HashMap<SessionId, Arc<ClientSession>>,
    /// Keyed by credential set id.
    connections: HashMap<String, Arc<ExchangeConnection>>,
}

/// Counts reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub sessions: usize,
    pub connections: usize,
}

/// Owns every client session and exchange connection.
pub struct Gateway {
    settings: GatewaySettings,
    endpoints: EndpointTable,
    validator: Arc<dyn TokenValidator>,
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    registry: RwLock<Registry>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        endpoints: EndpointTable,
        validator: Arc<dyn TokenValidator>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(settings.rest_timeout())
            .build()?;
        Ok(Self {
            settings,
            endpoints,
            validator,
            store,
            http,
            registry: RwLock::new(Registry::default()),
        })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn is_closed(&self) -> bool {
        self.registry.read().await.closed
    }

    pub async fn stats(&self) -> GatewayStats {
        let registry = self.registry.read().await;
        GatewayStats {
            sessions: registry.sessions.len(),
            connections: registry.connections.len(),
        }
    }

    /// Resolve an access token to a user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserIdentity, GatewayError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        Ok(self.validator.validate(token).await?)
    }

    /// Register a freshly upgraded client and acknowledge it.
    pub async fn register_session(
        &self,
        user: UserIdentity,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Arc<ClientSession>, GatewayError> {
        let session = Arc::new(ClientSession::new(user, tx));
        {
            let mut registry = self.registry.write().await;
            if registry.closed {
                return Err(GatewayError::Closed);
            }
            registry.sessions.insert(session.id, Arc::clone(&session));
        }
        info!(session = %session.id, user = %session.user.user_id, "Client connected");
        session.send(&NormalizedMessage::connected(
            None,
            serde_json::json!({ "sessionId": session.id }),
        ));
        Ok(session)
    }

    /// Handle one text frame. Every failure becomes a single error reply to
    /// this client; nothing here ends the session.
    pub async fn handle_text(&self, session: &ClientSession, text: &str) {
        let result = match ClientCommand::parse(text) {
            Ok(command) => self.dispatch(session, command).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(session = %session.id, error = %e, "Client request failed");
            let platform = self.bound_platform(session).await;
            session.send(&NormalizedMessage::error(platform, e.to_string()));
        }
    }

    pub async fn dispatch(
        &self,
        session: &ClientSession,
        command: ClientCommand,
    ) -> Result<(), GatewayError> {
        match command {
            ClientCommand::Connect { api_key_id } => self.connect(session, &api_key_id).await,
            ClientCommand::Subscribe(request) => self.subscribe(session, request).await,
            ClientCommand::Unsubscribe(request) => self.unsubscribe(session, request).await,
        }
    }

    /// Resolve a credential set for `session`'s user.
    async fn resolve_credentials(
        &self,
        session: &ClientSession,
        credential_id: &str,
    ) -> Result<CredentialSet, GatewayError> {
        let record = self
            .store
            .find(credential_id)
            .await?
            .ok_or(GatewayError::CredentialNotFound)?;
        if record.user_id != session.user.user_id {
            warn!(
                session = %session.id,
                credential = %credential_id,
                "Credential requested by a different user"
            );
            return Err(GatewayError::CredentialForbidden);
        }
        if !record.active {
            return Err(GatewayError::CredentialInactive);
        }
        let platform: Platform = record
            .platform
            .parse()
            .map_err(|_| GatewayError::UnsupportedPlatform(record.platform.clone()))?;
        Ok(CredentialSet {
            endpoints: self.endpoints.resolve(platform, record.testnet),
            id: record.id,
            user_id: record.user_id,
            platform,
            testnet: record.testnet,
            api_key: record.api_key,
            api_secret: record.api_secret,
        })
    }

    async fn connect(&self, session: &ClientSession, credential_id: &str) -> Result<(), GatewayError> {
        let credentials = self.resolve_credentials(session, credential_id).await?;
        let platform = credentials.platform;
        let testnet = credentials.testnet;

        match session.bound().await {
            Some(current) if current == credential_id => {}
            previous => {
                if let Some(previous) = previous {
                    session.unbind().await;
                    self.detach(&previous, session.id).await;
                }
                self.attach(session, credentials).await?;
                session.bind(credential_id.to_string()).await;
            }
        }

        info!(
            session = %session.id,
            credential = %credential_id,
            platform = %platform,
            "Client bound to credential set"
        );
        session.send(&NormalizedMessage::connected(
            Some(platform),
            serde_json::json!({ "apiKeyId": credential_id, "testnet": testnet }),
        ));
        Ok(())
    }

    /// Get-or-create the connection for `credentials` and attach the session.
    async fn attach(
        &self,
        session: &ClientSession,
        credentials: CredentialSet,
    ) -> Result<(), GatewayError> {
        loop {
            let connection = {
                let mut registry = self.registry.write().await;
                if registry.closed {
                    return Err(GatewayError::Closed);
                }
                Arc::clone(
                    registry
                        .connections
                        .entry(credentials.id.clone())
                        .or_insert_with(|| {
                            info!(
                                credential = %credentials.id,
                                platform = %credentials.platform,
                                "Creating exchange connection"
                            );
                            Arc::new(ExchangeConnection::new(
                                credentials.clone(),
                                adapter_for(credentials.platform),
                                self.settings.clone(),
                                self.http.clone(),
                            ))
                        }),
                )
            };
            if connection.attach(session.sink()).await {
                return Ok(());
            }
            // Lost a race with the last client leaving; drop the stale entry.
            self.forget(&credentials.id, &connection).await;
        }
    }

    async fn detach(&self, credential_id: &str, session: SessionId) {
        let connection = {
            let registry = self.registry.read().await;
            registry.connections.get(credential_id).cloned()
        };
        if let Some(connection) = connection {
            if connection.detach(session).await {
                self.forget(credential_id, &connection).await;
            }
        }
    }

    async fn forget(&self, credential_id: &str, connection: &Arc<ExchangeConnection>) {
        let mut registry = self.registry.write().await;
        if registry
            .connections
            .get(credential_id)
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            registry.connections.remove(credential_id);
        }
    }

    async fn bound_connection(
        &self,
        session: &ClientSession,
    ) -> Result<Arc<ExchangeConnection>, GatewayError> {
        let credential_id = session.bound().await.ok_or(GatewayError::NotConnected)?;
        let registry = self.registry.read().await;
        registry
            .connections
            .get(&credential_id)
            .cloned()
            .ok_or(GatewayError::NotConnected)
    }

    async fn bound_platform(&self, session: &ClientSession) -> Option<Platform> {
        self.bound_connection(session).await.ok().map(|c| c.platform())
    }

    fn subscription_key(
        connection: &ExchangeConnection,
        request: &StreamRequest,
    ) -> Result<SubscriptionKey, GatewayError> {
        let stream: StreamType = request.stream.parse().map_err(GatewayError::InvalidRequest)?;
        let depth = request.depth.map(|d| d.to_string());
        let param = match stream {
            StreamType::Kline => request.interval.as_deref(),
            StreamType::Orderbook => depth.as_deref(),
            _ => None,
        };
        Ok(connection.adapter().format_key(stream, &request.symbol, param)?)
    }

    async fn subscribe(&self, session: &ClientSession, request: StreamRequest) -> Result<(), GatewayError> {
        let connection = self.bound_connection(session).await?;
        let key = Self::subscription_key(&connection, &request)?;
        debug!(session = %session.id, key = %key, "Subscribe");
        connection.subscribe(session.id, key.clone()).await?;
        session.add_subscription(key).await;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        session: &ClientSession,
        request: StreamRequest,
    ) -> Result<(), GatewayError> {
        let connection = self.bound_connection(session).await?;
        let key = Self::subscription_key(&connection, &request)?;
        debug!(session = %session.id, key = %key, "Unsubscribe");
        if session.remove_subscription(&key).await {
            connection.unsubscribe(session.id, &key).await?;
        }
        Ok(())
    }

    /// Forget a session and release everything it held.
    pub async fn remove_client(&self, id: SessionId) {
        let session = self.registry.write().await.sessions.remove(&id);
        let Some(session) = session else {
            return;
        };
        if let Some(credential_id) = session.unbind().await {
            self.detach(&credential_id, id).await;
        }
        debug!(session = %id, "Client removed");
    }

    /// Stop accepting clients, close every connection and client socket.
    /// Returns false if the gateway was already shut down.
    pub async fn shutdown(&self) -> bool {
        let (sessions, connections) = {
            let mut registry = self.registry.write().await;
            if registry.closed {
                return false;
            }
            registry.closed = true;
            let sessions: Vec<_> = registry.sessions.drain().map(|(_, s)| s).collect();
            let connections: Vec<_> = registry.connections.drain().map(|(_, c)| c).collect();
            (sessions, connections)
        };
        info!(
            sessions = sessions.len(),
            connections = connections.len(),
            "Gateway shutting down"
        );
        for connection in connections {
            connection.close().await;
        }
        for session in sessions {
            session.close();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCredentialStore, EndpointOverride, StaticTokenValidator, TokenEntry};
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::io::Write;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn record(id: &str, user: &str, platform: &str, active: bool) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            platform: platform.to_string(),
            testnet: false,
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            active,
        }
    }

    fn gateway_with(ws_url: &str) -> Arc<Gateway> {
        let validator = StaticTokenValidator::new(vec![TokenEntry {
            token: "t-alice".to_string(),
            user_id: "alice".to_string(),
            username: None,
        }]);
        let store = ConfigCredentialStore::new(vec![
            record("k1", "alice", "btcc", true),
            record("k2", "alice", "binance", true),
            record("k-bob", "bob", "btcc", true),
            record("k-off", "alice", "btcc", false),
            record("k-kraken", "alice", "kraken", true),
        ]);
        let overrides = Platform::ALL
            .into_iter()
            .map(|p| {
                (
                    p,
                    EndpointOverride {
                        ws_url: Some(ws_url.to_string()),
                        rest_url: Some("http://127.0.0.1:9".to_string()),
                        ..EndpointOverride::default()
                    },
                )
            })
            .collect();
        let settings = GatewaySettings {
            dial_timeout_secs: 2,
            reconnect_attempts: 0,
            ..GatewaySettings::default()
        };
        Arc::new(
            Gateway::new(
                settings,
                EndpointTable::new(overrides),
                Arc::new(validator),
                Arc::new(store),
            )
            .unwrap(),
        )
    }

    fn gateway() -> Arc<Gateway> {
        gateway_with("ws://127.0.0.1:9")
    }

    fn alice() -> UserIdentity {
        UserIdentity {
            user_id: "alice".to_string(),
            username: None,
        }
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected a text message, got {:?}", other),
        }
    }

    async fn recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a client message");
        match msg {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected a text message, got {:?}", other),
        }
    }

    async fn session(
        gateway: &Gateway,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = gateway.register_session(alice(), tx).await.unwrap();
        let ack = next_json(&mut rx);
        assert_eq!(ack["type"], "connected");
        (session, rx)
    }

    #[tokio::test]
    async fn test_malformed_json_replies_once() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;

        gateway.handle_text(&session, "{not json").await;
        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "error");
        assert!(reply["error"].as_str().unwrap().starts_with("invalid message format"));
        assert!(rx.try_recv().is_err());

        // the session keeps working afterwards
        gateway.handle_text(&session, r#"{"action":"dance"}"#).await;
        let reply = next_json(&mut rx);
        assert_eq!(reply["error"], "unknown action: dance");
        assert!(rx.try_recv().is_err());
        assert_eq!(gateway.stats().await.sessions, 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connect() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;
        gateway
            .handle_text(&session, r#"{"action":"subscribe","type":"trades","symbol":"BTCUSDT"}"#)
            .await;
        let reply = next_json(&mut rx);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "not connected, call connect first");
        assert_eq!(gateway.stats().await.connections, 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_session_unchanged() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;
        gateway
            .handle_text(&session, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["type"], "connected");

        // the connection goes away underneath the bound session
        gateway.bound_connection(&session).await.unwrap().close().await;
        gateway
            .handle_text(&session, r#"{"action":"subscribe","type":"trades","symbol":"BTCUSDT"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["type"], "error");
        assert!(session.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_credential_rejections() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;
        let cases = [
            ("missing", "api key not found"),
            ("k-bob", "api key does not belong to this user"),
            ("k-off", "api key is inactive"),
            ("k-kraken", "unsupported platform: kraken"),
        ];
        for (id, expected) in cases {
            gateway
                .handle_text(&session, &json!({"action": "connect", "apiKeyId": id}).to_string())
                .await;
            let reply = next_json(&mut rx);
            assert_eq!(reply["type"], "error");
            assert_eq!(reply["error"], expected);
            assert!(rx.try_recv().is_err());
        }
        assert_eq!(gateway.stats().await.connections, 0);
        assert!(session.bound().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_shares_and_removes_connection() {
        let gateway = gateway();
        let (first, mut rx1) = session(&gateway).await;
        let (second, mut rx2) = session(&gateway).await;

        gateway
            .handle_text(&first, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        gateway
            .handle_text(&second, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        let ack = next_json(&mut rx1);
        assert_eq!(ack["type"], "connected");
        assert_eq!(ack["platform"], "btcc");
        assert_eq!(ack["data"]["apiKeyId"], "k1");
        assert_eq!(ack["data"]["testnet"], false);
        assert_eq!(next_json(&mut rx2)["type"], "connected");
        assert_eq!(
            gateway.stats().await,
            GatewayStats {
                sessions: 2,
                connections: 1
            }
        );

        gateway.remove_client(first.id).await;
        assert_eq!(gateway.stats().await.connections, 1);
        gateway.remove_client(second.id).await;
        assert_eq!(
            gateway.stats().await,
            GatewayStats {
                sessions: 0,
                connections: 0
            }
        );
        // removing twice is harmless
        gateway.remove_client(second.id).await;
    }

    #[tokio::test]
    async fn test_reconnect_to_other_set_detaches() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;
        gateway
            .handle_text(&session, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["platform"], "btcc");

        gateway
            .handle_text(&session, r#"{"action":"connect","apiKeyId":"k2"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["platform"], "binance");
        assert_eq!(session.bound().await.as_deref(), Some("k2"));
        assert_eq!(gateway.stats().await.connections, 1);
        let registry = gateway.registry.read().await;
        assert!(registry.connections.contains_key("k2"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let gateway = gateway();
        let (session, mut rx) = session(&gateway).await;
        gateway
            .handle_text(&session, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        let _ = next_json(&mut rx);

        assert!(gateway.shutdown().await);
        assert!(!gateway.shutdown().await);
        assert!(gateway.is_closed().await);
        assert_eq!(
            gateway.stats().await,
            GatewayStats {
                sessions: 0,
                connections: 0
            }
        );
        assert!(matches!(rx.try_recv(), Ok(Message::Close(Some(_)))));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            gateway.register_session(alice(), tx).await,
            Err(GatewayError::Closed)
        ));
        gateway.remove_client(session.id).await;
    }

    #[tokio::test]
    async fn test_authenticate() {
        let gateway = gateway();
        assert_eq!(gateway.authenticate(Some("t-alice")).await.unwrap(), alice());
        assert!(matches!(
            gateway.authenticate(None).await,
            Err(GatewayError::Unauthorized(AuthError::MissingToken))
        ));
        assert!(matches!(
            gateway.authenticate(Some("t-mallory")).await,
            Err(GatewayError::Unauthorized(AuthError::InvalidToken))
        ));
    }

    fn deflate(text: &str) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn test_rpc_upstream_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel::<Value>();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let request: Value = loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => break serde_json::from_str(&text).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("upstream closed early: {:?}", other),
                }
            };
            let id = request["id"].as_u64().unwrap();
            let _ = seen_tx.send(request);
            ws.send(WsMessage::Text(
                json!({"id": id, "error": null, "result": {"status": "success"}}).to_string(),
            ))
            .await
            .unwrap();
            let push = json!({
                "id": null,
                "method": "kline.update",
                "params": [[1700000000, "100", "105", "106", "99", "10", "1000", "BTCUSDT"]]
            });
            ws.send(WsMessage::Binary(deflate(&push.to_string())))
                .await
                .unwrap();
            // Wait for the gateway to hang up.
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        });

        let gateway = gateway_with(&format!("ws://{}", addr));
        let (session, mut rx) = session(&gateway).await;
        gateway
            .handle_text(&session, r#"{"action":"connect","apiKeyId":"k1"}"#)
            .await;
        assert_eq!(recv_json(&mut rx).await["type"], "connected");

        gateway
            .handle_text(
                &session,
                r#"{"action":"subscribe","type":"kline","symbol":"btcusdt","interval":"1m"}"#,
            )
            .await;

        let request = tokio::time::timeout(Duration::from_secs(5), seen_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request["method"], "kline.subscribe");
        assert_eq!(request["params"], json!(["BTCUSDT", 60]));

        let kline = recv_json(&mut rx).await;
        assert_eq!(kline["type"], "kline");
        assert_eq!(kline["platform"], "btcc");
        assert_eq!(kline["symbol"], "BTCUSDT");
        assert_eq!(kline["data"]["open"], "100");
        assert_eq!(kline["data"]["close"], "105");
        assert_eq!(kline["data"]["amount"], "1000");

        gateway.remove_client(session.id).await;
        assert_eq!(gateway.stats().await.connections, 0);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("upstream socket was not closed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stateless_upstream_shared_interest() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, mut path_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let path_tx = path_tx.clone();
                tokio::spawn(async move {
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = path_tx.send(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await
                    else {
                        return;
                    };
                    let trade = json!({
                        "stream": "btcusdt@trade",
                        "data": {"e": "trade", "s": "BTCUSDT", "t": 1, "p": "100.5", "q": "2", "T": 1700000000000i64, "m": false}
                    });
                    let _ = ws.send(WsMessage::Text(trade.to_string())).await;
                    while let Some(Ok(msg)) = ws.next().await {
                        if matches!(msg, WsMessage::Close(_)) {
                            break;
                        }
                    }
                });
            }
        });

        let gateway = gateway_with(&format!("ws://{}", addr));
        let (first, mut rx1) = session(&gateway).await;
        let (second, mut rx2) = session(&gateway).await;
        for s in [&first, &second] {
            gateway
                .handle_text(s, r#"{"action":"connect","apiKeyId":"k2"}"#)
                .await;
        }
        assert_eq!(recv_json(&mut rx1).await["type"], "connected");
        assert_eq!(recv_json(&mut rx2).await["type"], "connected");

        let subscribe = r#"{"action":"subscribe","type":"trades","symbol":"BTCUSDT"}"#;
        gateway.handle_text(&first, subscribe).await;
        let path = tokio::time::timeout(Duration::from_secs(5), path_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, "/stream?streams=btcusdt@trade");

        let trades = recv_json(&mut rx1).await;
        assert_eq!(trades["type"], "trades");
        assert_eq!(trades["platform"], "binance");
        assert_eq!(trades["symbol"], "BTCUSDT");
        // fan-out reaches every attached client
        assert_eq!(recv_json(&mut rx2).await["type"], "trades");

        // a second subscriber to the same key does not redial
        gateway.handle_text(&second, subscribe).await;
        let unsubscribe = r#"{"action":"unsubscribe","type":"trades","symbol":"BTCUSDT"}"#;
        gateway.handle_text(&second, unsubscribe).await;
        assert!(path_rx.try_recv().is_err());

        let connection = gateway.bound_connection(&first).await.unwrap();
        assert_eq!(
            connection.active_keys(crate::connection::Side::Public).await,
            vec!["trades:BTCUSDT"]
        );
        gateway.handle_text(&first, unsubscribe).await;
        assert!(connection
            .active_keys(crate::connection::Side::Public)
            .await
            .is_empty());
        assert_eq!(
            connection.slot_state(crate::connection::Side::Public).await,
            crate::connection::SlotState::Idle
        );
    }
}
