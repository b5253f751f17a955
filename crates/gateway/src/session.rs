//! Browser client sessions: outbound channel, bound credential set, read loop.

use crate::gateway::Gateway;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use exgate_core::{NormalizedMessage, SubscriptionKey, UserIdentity};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// How long the writer may take to flush after the read loop ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Sending half of a client's outbound channel.
#[derive(Debug, Clone)]
pub struct ClientSink {
    id: SessionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientSink {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn send(&self, msg: &NormalizedMessage) -> bool {
        self.send_text(msg.to_json().into())
    }

    /// Queue a pre-serialized frame. False once the client is gone.
    pub fn send_text(&self, text: Utf8Bytes) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    fn send_raw(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    bound: Option<String>,
    subscriptions: BTreeSet<SubscriptionKey>,
}

/// One accepted browser connection.
pub struct ClientSession {
    pub id: SessionId,
    pub user: UserIdentity,
    sink: ClientSink,
    state: RwLock<SessionState>,
    shutdown: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(user: UserIdentity, tx: mpsc::UnboundedSender<Message>) -> Self {
        let id = Uuid::new_v4();
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            user,
            sink: ClientSink { id, tx },
            state: RwLock::new(SessionState::default()),
            shutdown,
        }
    }

    pub fn sink(&self) -> ClientSink {
        self.sink.clone()
    }

    pub fn send(&self, msg: &NormalizedMessage) -> bool {
        self.sink.send(msg)
    }

    /// Credential set this session is attached to.
    pub async fn bound(&self) -> Option<String> {
        self.state.read().await.bound.clone()
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.state.read().await.subscriptions.iter().cloned().collect()
    }

    pub(crate) async fn bind(&self, credential_id: String) {
        let mut state = self.state.write().await;
        state.bound = Some(credential_id);
        state.subscriptions.clear();
    }

    /// Clear the binding, returning the credential set id it pointed at.
    pub(crate) async fn unbind(&self) -> Option<String> {
        let mut state = self.state.write().await;
        state.subscriptions.clear();
        state.bound.take()
    }

    pub(crate) async fn add_subscription(&self, key: SubscriptionKey) {
        self.state.write().await.subscriptions.insert(key);
    }

    pub(crate) async fn remove_subscription(&self, key: &SubscriptionKey) -> bool {
        self.state.write().await.subscriptions.remove(key)
    }

    /// Ask the read loop to stop and close the socket with a going-away frame.
    pub(crate) fn close(&self) {
        self.shutdown.send_replace(true);
        let _ = self.sink.send_raw(Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        })));
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Drive one upgraded socket until the client leaves, goes silent, or the
/// gateway shuts down.
pub async fn run(gateway: Arc<Gateway>, socket: WebSocket, user: UserIdentity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let session = match gateway.register_session(user, tx).await {
        Ok(session) => session,
        Err(e) => {
            debug!(error = %e, "Rejecting socket");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: "service unavailable".into(),
                })))
                .await;
            return;
        }
    };
    let id = session.id;

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let settings = gateway.settings();
    let pong_wait = settings.pong_wait();
    let mut ping = interval(settings.ping_period());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;
    let mut deadline = Instant::now() + pong_wait;
    let mut shutdown = session.shutdown_signal();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(session = %id, error = %e, "Client socket error");
                        break;
                    }
                    None => break,
                };
                deadline = Instant::now() + pong_wait;
                match msg {
                    Message::Text(text) => gateway.handle_text(&session, text.as_str()).await,
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => gateway.handle_text(&session, text).await,
                        Err(_) => {
                            session.send(&NormalizedMessage::error(
                                None,
                                "invalid message format: binary frame is not UTF-8",
                            ));
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            _ = ping.tick() => {
                if Instant::now() >= deadline {
                    warn!(session = %id, "Client missed liveness deadline");
                    break;
                }
                if !session.sink.send_raw(Message::Ping(Default::default())) {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    gateway.remove_client(id).await;
    drop(session);
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(session = %id, "Client disconnected");
}
