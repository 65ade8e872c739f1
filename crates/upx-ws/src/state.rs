//! Stream connection state machine.
//!
//! The scheduler loop in `StreamClient` is the only writer. Observers read the
//! current state through a `watch` channel.

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, info};
use upx_telemetry::Metrics;

use crate::error::{WsError, WsResult};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Disconnected,
    Connecting,
    /// Connected; replaying the subscription set.
    Subscribing,
    Live,
    /// No inbound frame within the idle timeout.
    IdleDetected,
    /// Transport or protocol error on an established connection.
    Errored,
    /// Waiting out the backoff before the next connect.
    Reconnecting,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Live => "live",
            Self::IdleDetected => "idle_detected",
            Self::Errored => "errored",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Legal transition table. Shutdown may force `Disconnected` from anywhere.
    pub fn can_transition_to(&self, next: StreamState) -> bool {
        use StreamState::*;
        if next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Subscribing | Reconnecting)
                | (Subscribing, Live | Errored)
                | (Live, IdleDetected | Errored | Reconnecting)
                | (IdleDetected, Reconnecting)
                | (Errored, Reconnecting)
                | (Reconnecting, Connecting)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the current state.
pub struct StateMachine {
    tx: watch::Sender<StreamState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StreamState::Disconnected);
        Metrics::ws_state_set(StreamState::Disconnected.as_str());
        Self { tx }
    }

    pub fn current(&self) -> StreamState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting transitions outside the table.
    pub fn transition(&self, next: StreamState) -> WsResult<()> {
        let from = self.current();
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(WsError::InvalidTransition { from, to: next });
        }

        self.tx.send_replace(next);
        Metrics::ws_state_set(next.as_str());
        match next {
            StreamState::Live | StreamState::Disconnected => {
                info!(%from, to = %next, "Stream state changed")
            }
            _ => debug!(%from, to = %next, "Stream state changed"),
        }
        Ok(())
    }

    /// Force `Disconnected` (shutdown).
    pub fn force_disconnected(&self) {
        let from = self.current();
        if from != StreamState::Disconnected {
            self.tx.send_replace(StreamState::Disconnected);
            Metrics::ws_state_set(StreamState::Disconnected.as_str());
            info!(%from, "Stream disconnected");
        }
    }
}
