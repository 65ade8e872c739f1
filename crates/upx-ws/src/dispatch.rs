//! Frame dispatch to registered handlers.
//!
//! Handlers are bounded channels. The read loop never waits on a handler: a
//! full or closed channel drops the frame, which is logged and counted.
//! `dispatch` reports the drop so the client can announce the gap.

use tokio::sync::mpsc;
use tracing::{trace, warn};
use upx_core::OrderEvent;
use upx_telemetry::Metrics;

use crate::frame::{AssetSnapshot, StreamFrame};

/// Default capacity of each handler channel.
pub const DEFAULT_HANDLER_CAPACITY: usize = 1024;

/// Routes normalized frames to handler channels by type.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    orders: Option<mpsc::Sender<OrderEvent>>,
    assets: Option<mpsc::Sender<AssetSnapshot>>,
    market: Option<mpsc::Sender<StreamFrame>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order updates (`myOrder`).
    pub fn with_orders(mut self, tx: mpsc::Sender<OrderEvent>) -> Self {
        self.orders = Some(tx);
        self
    }

    /// Balance updates (`myAsset`).
    pub fn with_assets(mut self, tx: mpsc::Sender<AssetSnapshot>) -> Self {
        self.assets = Some(tx);
        self
    }

    /// Market data (`ticker`, `trade`, `orderbook`).
    pub fn with_market(mut self, tx: mpsc::Sender<StreamFrame>) -> Self {
        self.market = Some(tx);
        self
    }

    /// Hand a frame to its handler. Returns false if it was dropped.
    pub fn dispatch(&self, frame: StreamFrame) -> bool {
        let kind = frame.kind();
        let delivered = match frame {
            StreamFrame::MyOrder(event) => offer(self.orders.as_ref(), event, kind),
            StreamFrame::MyAsset(snapshot) => offer(self.assets.as_ref(), snapshot, kind),
            frame @ (StreamFrame::Ticker(_) | StreamFrame::Trade(_) | StreamFrame::Orderbook(_)) => {
                offer(self.market.as_ref(), frame, kind)
            }
            StreamFrame::Status(status) => {
                trace!(%status, "Stream status frame");
                true
            }
        };
        if delivered {
            Metrics::ws_frame(kind);
        }
        delivered
    }
}

fn offer<T>(tx: Option<&mpsc::Sender<T>>, item: T, kind: &'static str) -> bool {
    let Some(tx) = tx else {
        trace!(kind, "No handler registered, frame ignored");
        return true;
    };
    match tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(kind, "Handler channel full, frame dropped");
            Metrics::ws_frame_dropped(kind);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(kind, "Handler channel closed, frame dropped");
            Metrics::ws_frame_dropped(kind);
            false
        }
    }
}
