//! Streaming client.
//!
//! One scheduler loop drives the connection state machine: connect, replay
//! the subscription set, read until the connection dies, back off, repeat.
//! Every reconnect is treated as a data gap and announced through
//! `StreamEvent::Resynced` so reconciliation can run early. An account frame
//! dropped by a saturated handler is a gap too (`StreamEvent::FramesDropped`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upx_telemetry::Metrics;

use crate::connector::{Connection, Connector};
use crate::dispatch::Dispatcher;
use crate::error::{WsError, WsResult};
use crate::frame::parse_frame;
use crate::liveness::{Liveness, DEFAULT_IDLE_TIMEOUT, DEFAULT_PING_INTERVAL};
use crate::state::{StateMachine, StreamState};
use crate::subscription::{Subscription, SubscriptionSet};

/// Public stream endpoint.
pub const PUBLIC_URL: &str = "wss://api.upbit.com/websocket/v1";
/// Private stream endpoint (`myOrder`, `myAsset`).
pub const PRIVATE_URL: &str = "wss://api.upbit.com/websocket/v1/private";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Produces a fresh `Authorization` header value for each connect.
pub type Authorizer = Arc<dyn Fn() -> WsResult<String> + Send + Sync>;

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: PUBLIC_URL.to_string(),
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
        }
    }
}

/// Signals for stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Live again after a reconnect; frames may have been missed.
    Resynced { reconnects: u64 },
    /// An account frame was dropped while the connection stayed up.
    FramesDropped { kind: &'static str },
}

/// How one connection ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    ConnectFailed(WsError),
    Idle,
    Errored(WsError),
    /// Subscription set shrank; reconnect without backoff.
    Recycle,
}

struct Shared {
    subscriptions: RwLock<SubscriptionSet>,
    state: StateMachine,
    events: broadcast::Sender<StreamEvent>,
    sync: Notify,
    shutdown_token: CancellationToken,
    reconnects: AtomicU64,
    authorized: bool,
}

/// Cloneable handle for subscribing and observing a running client.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    /// Add a subscription. Sent right away if the connection is live, and
    /// replayed on every later connect.
    ///
    /// Returns false if the subscription was already present.
    pub fn subscribe(&self, subscription: Subscription) -> WsResult<bool> {
        if self.shared.shutdown_token.is_cancelled() {
            return Err(WsError::ShutDown);
        }
        if subscription.channel.is_private() && !self.shared.authorized {
            return Err(WsError::SubscriptionError(format!(
                "{} needs an authenticated client",
                subscription.channel
            )));
        }

        let added = self.shared.subscriptions.write().insert(subscription)?.is_some();
        if added {
            self.shared.sync.notify_one();
        }
        Ok(added)
    }

    /// Remove a subscription. The connection is recycled so the remaining
    /// set is replayed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = self.shared.subscriptions.write().remove(subscription);
        if removed {
            self.shared.sync.notify_one();
        }
        removed
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subscriptions.read().subscriptions()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.current()
    }

    pub fn state_watch(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Signal graceful shutdown. The run loop exits promptly, including out
    /// of a backoff wait.
    pub fn shutdown(&self) {
        info!("Stream shutdown requested");
        self.shared.shutdown_token.cancel();
    }
}

/// Streaming client.
pub struct StreamClient {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    authorizer: Option<Authorizer>,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
}

impl StreamClient {
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        authorizer: Option<Authorizer>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            subscriptions: RwLock::new(SubscriptionSet::new()),
            state: StateMachine::new(),
            events,
            sync: Notify::new(),
            shutdown_token: CancellationToken::new(),
            reconnects: AtomicU64::new(0),
            authorized: authorizer.is_some(),
        });
        Self {
            config,
            connector,
            authorizer,
            dispatcher,
            shared,
        }
    }

    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.current()
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown_token.is_cancelled()
    }

    /// Run the connection loop until shutdown.
    pub async fn run(&self) -> WsResult<()> {
        let mut attempt = 0u32;
        let mut ever_live = false;

        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting stream loop");
                self.shared.state.force_disconnected();
                return Ok(());
            }

            self.shared.state.transition(StreamState::Connecting)?;
            let end = self.run_session(&mut attempt, &mut ever_live).await?;

            let backoff = match end {
                SessionEnd::Shutdown => {
                    info!("Stream loop stopped");
                    self.shared.state.force_disconnected();
                    return Ok(());
                }
                SessionEnd::ConnectFailed(e) => {
                    warn!(error = %e, attempt, "Stream connect failed");
                    Metrics::ws_reconnect("connect_failed");
                    self.shared.state.transition(StreamState::Reconnecting)?;
                    true
                }
                SessionEnd::Idle => {
                    Metrics::ws_reconnect("idle");
                    self.shared.state.transition(StreamState::IdleDetected)?;
                    self.shared.state.transition(StreamState::Reconnecting)?;
                    true
                }
                SessionEnd::Errored(e) => {
                    error!(error = %e, "Stream connection error");
                    Metrics::ws_reconnect("error");
                    self.shared.state.transition(StreamState::Errored)?;
                    self.shared.state.transition(StreamState::Reconnecting)?;
                    true
                }
                SessionEnd::Recycle => {
                    info!("Subscription set shrank, recycling connection");
                    Metrics::ws_reconnect("recycle");
                    self.shared.state.transition(StreamState::Reconnecting)?;
                    false
                }
            };
            self.shared.reconnects.fetch_add(1, Ordering::Relaxed);

            if !backoff {
                continue;
            }
            attempt += 1;
            let delay = self.calculate_backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shared.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.shared.state.force_disconnected();
                    return Ok(());
                }
            }
        }
    }

    /// One connection from connect to teardown.
    ///
    /// Errors only on state machine violations; connection failures are
    /// reported through `SessionEnd`.
    async fn run_session(&self, attempt: &mut u32, ever_live: &mut bool) -> WsResult<SessionEnd> {
        let authorization = match &self.authorizer {
            Some(authorize) => match authorize() {
                Ok(value) => Some(value),
                Err(e) => return Ok(SessionEnd::ConnectFailed(e)),
            },
            None => None,
        };

        let connection = tokio::select! {
            () = self.shared.shutdown_token.cancelled() => return Ok(SessionEnd::Shutdown),
            result = self.connector.connect(&self.config.url, authorization) => result,
        };
        let Connection {
            mut sink,
            mut stream,
        } = match connection {
            Ok(connection) => connection,
            Err(e) => return Ok(SessionEnd::ConnectFailed(e)),
        };

        self.shared.state.transition(StreamState::Subscribing)?;

        // Replay the held set verbatim.
        let payloads = self.shared.subscriptions.read().payloads();
        let mut sent: HashSet<String> = HashSet::with_capacity(payloads.len());
        for payload in payloads {
            if let Err(e) = sink.send(Message::Text(payload.clone())).await {
                return Ok(SessionEnd::Errored(e));
            }
            sent.insert(payload);
        }
        info!(count = sent.len(), "Subscriptions replayed");

        self.shared.state.transition(StreamState::Live)?;
        *attempt = 0;
        if *ever_live {
            let reconnects = self.shared.reconnects.load(Ordering::Relaxed);
            info!(reconnects, "Stream resynced, assuming a data gap");
            // No receivers is fine.
            let _ = self.shared.events.send(StreamEvent::Resynced { reconnects });
        }
        *ever_live = true;

        let mut liveness = Liveness::new(
            self.config.ping_interval,
            self.config.idle_timeout,
            Instant::now(),
        );

        loop {
            tokio::select! {
                () = self.shared.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in read loop");
                    close_quietly(&mut sink).await;
                    return Ok(SessionEnd::Shutdown);
                }

                msg = stream.next() => {
                    let message = match msg {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Ok(SessionEnd::Errored(e)),
                        None => {
                            return Ok(SessionEnd::Errored(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            }));
                        }
                    };
                    liveness.record_inbound(Instant::now());

                    match message {
                        Message::Text(text) => self.handle_payload(text.as_bytes()),
                        Message::Binary(data) => self.handle_payload(&data),
                        Message::Ping(data) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                return Ok(SessionEnd::Errored(e));
                            }
                        }
                        Message::Pong(_) => debug!("Received pong"),
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "Stream closed by server");
                            return Ok(SessionEnd::Errored(WsError::ConnectionClosed { code, reason }));
                        }
                        Message::Frame(_) => {}
                    }
                }

                () = self.shared.sync.notified() => {
                    let current = self.shared.subscriptions.read().payloads();
                    let current_set: HashSet<&String> = current.iter().collect();
                    if sent.iter().any(|p| !current_set.contains(p)) {
                        close_quietly(&mut sink).await;
                        return Ok(SessionEnd::Recycle);
                    }
                    for payload in current {
                        if sent.contains(&payload) {
                            continue;
                        }
                        if let Err(e) = sink.send(Message::Text(payload.clone())).await {
                            return Ok(SessionEnd::Errored(e));
                        }
                        debug!("Subscription sent on live connection");
                        sent.insert(payload);
                    }
                }

                () = tokio::time::sleep_until(liveness.next_check()) => {
                    let now = Instant::now();
                    if liveness.is_idle(now) {
                        warn!(
                            idle_secs = liveness.idle_timeout().as_secs(),
                            "No inbound frame within idle timeout, dropping connection"
                        );
                        close_quietly(&mut sink).await;
                        return Ok(SessionEnd::Idle);
                    }
                    if liveness.should_ping(now) {
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            return Ok(SessionEnd::Errored(e));
                        }
                        liveness.record_ping(now);
                    }
                }
            }
        }
    }

    fn handle_payload(&self, payload: &[u8]) {
        match parse_frame(payload) {
            Ok(Some(frame)) => {
                let private = frame.is_private();
                let kind = frame.kind();
                if !self.dispatcher.dispatch(frame) && private {
                    let _ = self.shared.events.send(StreamEvent::FramesDropped { kind });
                }
            }
            Ok(None) => debug!("Ignoring frame of unknown type"),
            Err(WsError::SubscriptionError(message)) => {
                error!(%message, "Stream rejected subscription");
            }
            Err(e) => warn!(error = %e, "Failed to parse stream frame"),
        }
    }

    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay_ms;
        let max = self.config.reconnect_max_delay_ms;

        // base * 2^(attempt-1), capped.
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base.saturating_mul(1u64 << exponent).min(max);

        Duration::from_millis(delay + rand_jitter())
    }
}

async fn close_quietly(sink: &mut crate::connector::MessageSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Close frame not sent"),
        Err(_) => debug!("Close frame timed out"),
    }
}

/// Random jitter (0-999ms).
fn rand_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as u64
}
