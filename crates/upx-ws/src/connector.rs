//! Transport seam for the streaming client.
//!
//! `TungsteniteConnector` opens real TLS connections. `ChannelConnector` hands
//! each connection to the caller as a pair of in-process channels, so the
//! reconnect loop can be driven end to end under a paused clock.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::{sink, stream, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::error::{WsError, WsResult};

/// Boxed future type for connector methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound half of a connection.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Inbound half of a connection.
pub type MessageStream = Pin<Box<dyn Stream<Item = WsResult<Message>> + Send>>;

/// An open connection, already split.
pub struct Connection {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

/// Opens stream connections.
pub trait Connector: Send + Sync {
    /// Connect to `url`, sending `authorization` as the `Authorization` header.
    fn connect<'a>(
        &'a self,
        url: &'a str,
        authorization: Option<String>,
    ) -> BoxFuture<'a, WsResult<Connection>>;
}

// ============================================================================
// Tungstenite
// ============================================================================

/// TLS websocket connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TungsteniteConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        authorization: Option<String>,
    ) -> BoxFuture<'a, WsResult<Connection>> {
        Box::pin(async move {
            info!(%url, private = authorization.is_some(), "Connecting to stream");

            let mut request = url.into_client_request()?;
            if let Some(authorization) = authorization {
                let value = HeaderValue::from_str(&authorization)
                    .map_err(|e| WsError::ConnectionFailed(format!("invalid auth header: {e}")))?;
                request.headers_mut().insert("Authorization", value);
            }

            // TCP_NODELAY on.
            let (ws_stream, _response) =
                connect_async_tls_with_config(request, None, true, None).await?;
            let (write, read) = ws_stream.split();
            debug!("Stream socket established");

            Ok(Connection {
                sink: Box::pin(write.sink_map_err(WsError::from)),
                stream: Box::pin(read.map(|msg| msg.map_err(WsError::from))),
            })
        })
    }
}

// ============================================================================
// In-process channels
// ============================================================================

/// Server side of one in-process connection.
pub struct MockSession {
    pub url: String,
    pub authorization: Option<String>,
    /// Everything the client sent, in order.
    pub sent: mpsc::UnboundedReceiver<Message>,
    /// Push frames (or errors) to the client. Dropping it ends the stream.
    pub incoming: mpsc::UnboundedSender<WsResult<Message>>,
}

impl MockSession {
    /// Push a text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.incoming.send(Ok(Message::Text(text.into()))).is_ok()
    }

    /// Push a binary frame to the client.
    pub fn push_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.incoming.send(Ok(Message::Binary(data.into()))).is_ok()
    }

    /// Next text frame the client sent, skipping control frames.
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(message) = self.sent.recv().await {
            if let Message::Text(text) = message {
                return Some(text);
            }
        }
        None
    }
}

/// Connector that hands every connection to a test as a `MockSession`.
pub struct ChannelConnector {
    sessions: mpsc::UnboundedSender<MockSession>,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockSession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions,
                fail_remaining: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for ChannelConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        authorization: Option<String>,
    ) -> BoxFuture<'a, WsResult<Connection>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(WsError::ConnectionFailed("connection refused".to_string()));
            }

            let (client_tx, sent) = mpsc::unbounded_channel::<Message>();
            let (incoming, client_rx) = mpsc::unbounded_channel::<WsResult<Message>>();

            self.sessions
                .send(MockSession {
                    url: url.to_string(),
                    authorization,
                    sent,
                    incoming,
                })
                .map_err(|_| WsError::ConnectionFailed("no session listener".to_string()))?;

            let sink = sink::unfold(client_tx, |tx, message: Message| async move {
                tx.send(message)
                    .map_err(|_| WsError::SendFailed("peer closed".to_string()))?;
                Ok::<_, WsError>(tx)
            });
            let stream = stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}
