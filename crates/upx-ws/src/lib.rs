//! Streaming client for exchange order and market updates.
//!
//! Provides resilient stream connectivity with:
//! - Explicit connection state machine with a validated transition table
//! - 30s liveness pings and 120s idle detection
//! - Reconnection with exponential backoff and jitter, cancellable on shutdown
//! - Verbatim subscription replay after every reconnect
//! - `DEFAULT` and `SIMPLE` frame encodings normalized into one frame enum
//! - Non-blocking dispatch to bounded handler channels

pub mod client;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod liveness;
pub mod state;
pub mod subscription;

pub use client::{
    Authorizer, StreamClient, StreamConfig, StreamEvent, StreamHandle, PRIVATE_URL, PUBLIC_URL,
};
pub use connector::{
    BoxFuture, ChannelConnector, Connection, Connector, MessageSink, MessageStream, MockSession,
    TungsteniteConnector,
};
pub use dispatch::{Dispatcher, DEFAULT_HANDLER_CAPACITY};
pub use error::{WsError, WsResult};
pub use frame::{
    parse_frame, AssetSnapshot, OrderbookFrame, OrderbookUnit, StreamFrame, TickerFrame,
    TradeFrame,
};
pub use liveness::{Liveness, DEFAULT_IDLE_TIMEOUT, DEFAULT_PING_INTERVAL};
pub use state::{StateMachine, StreamState};
pub use subscription::{Channel, Encoding, Subscription, SubscriptionKey, SubscriptionSet};

/// Re-exported so callers can build frames for `MockSession`.
pub use tokio_tungstenite::tungstenite::Message;

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any stream connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
