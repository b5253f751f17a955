//! One outbound WebSocket to an exchange.
//!
//! Writes go through an unbounded channel drained by a writer task, so any
//! holder of an [`UpstreamSender`] can queue a frame without touching the
//! socket. The read half is handed back to the caller.

use crate::error::{redact_url, GatewayError};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

pub type UpstreamReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Cloneable handle for queuing frames on an upstream socket.
#[derive(Debug, Clone)]
pub struct UpstreamSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl UpstreamSender {
    /// Queue a text frame. False if the writer is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }
}

/// A live upstream socket owned by a connection slot.
#[derive(Debug)]
pub struct Upstream {
    /// Dial generation this socket belongs to.
    pub generation: u64,
    /// Out-of-band stream token the socket was opened with, if any.
    pub token: Option<String>,
    sender: UpstreamSender,
    stop: watch::Sender<bool>,
}

impl Upstream {
    pub fn sender(&self) -> UpstreamSender {
        self.sender.clone()
    }

    /// Receiver that fires when this socket is closed.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Signal the socket's tasks to stop and send a close frame.
    pub fn close(&self) {
        self.stop.send_replace(true);
        let _ = self.sender.tx.send(Message::Close(None));
    }
}

/// Open a WebSocket to `url`, bounded by `timeout`.
pub async fn dial(
    url: &str,
    timeout: Duration,
    generation: u64,
) -> Result<(Upstream, UpstreamReader), GatewayError> {
    let target = redact_url(url);
    let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| GatewayError::Timeout(target.clone()))?
        .map_err(|e| GatewayError::Dial {
            target: target.clone(),
            reason: e.to_string(),
        })?;
    info!(target = %target, generation, "Upstream connected");

    let (mut sink, reader) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (stop, _) = watch::channel(false);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!(target = %target, error = %e, "Upstream write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
        debug!(target = %target, "Upstream writer finished");
    });

    let upstream = Upstream {
        generation,
        token: None,
        sender: UpstreamSender { tx },
        stop,
    };
    Ok((upstream, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => received.push(text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let (upstream, _reader) = dial(&format!("ws://{}", addr), Duration::from_secs(5), 7)
            .await
            .unwrap();
        assert_eq!(upstream.generation, 7);
        let mut stop = upstream.stop_signal();
        assert!(upstream.sender().send_text("hello".to_string()));
        upstream.close();
        stop.changed().await.unwrap();
        assert!(*stop.borrow());

        let received = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = dial(&format!("ws://{}/ws/token", addr), Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Dial { .. }));
        assert!(!err.to_string().contains("token"));
    }
}
