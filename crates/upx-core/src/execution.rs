//! Order lifecycle types.
//!
//! `Order` is the tracked record of one submitted (or adopted) exchange order.
//! The transition rules on `OrderState` are the single place that decides
//! which moves are legal; everything else asks `can_transition_to`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::decimal::{Price, Size};
use crate::market::MarketCode;
use crate::order::{ClientOrderId, OrderKind, OrderRequest, OrderSide};

// ============================================================================
// Order State
// ============================================================================

/// State of a tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Exchange acknowledged receipt. Nothing is known about execution.
    Accepted,
    /// Some volume executed, some still resting.
    PartiallyFilled,
    /// No terminal event within the business timeout; awaiting policy.
    TimedOut,
    /// Fully executed.
    Filled,
    /// Cancelled, with whatever volume executed before the cancel.
    Cancelled,
    /// Cancelled and replaced by a successor order.
    Retried,
    /// Handed to an operator. Never resolved automatically.
    Escalated,
}

impl OrderState {
    /// Position in the lifecycle. Transitions never go to a lower rank.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::PartiallyFilled => 1,
            Self::TimedOut => 2,
            Self::Escalated => 3,
            Self::Filled | Self::Cancelled | Self::Retried => 4,
        }
    }

    /// Returns true if the order will never change state again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Retried)
    }

    /// Returns true if the order may still execute and is subject to timeouts.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Accepted | Self::PartiallyFilled)
    }

    /// Legal transition table.
    #[must_use]
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Accepted, PartiallyFilled | Filled | Cancelled | TimedOut)
                | (PartiallyFilled, Filled | Cancelled | TimedOut)
                | (TimedOut, Filled | Cancelled | Retried | Escalated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::PartiallyFilled => "partially_filled",
            Self::TimedOut => "timed_out",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Retried => "retried",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tracked Order
// ============================================================================

/// Link from a resubmitted order back to its originating intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Identifier of the first submission.
    pub root: ClientOrderId,
    /// Identifier of the order this one replaced.
    pub parent: ClientOrderId,
}

/// Tracked order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub identifier: ClientOrderId,
    /// Exchange-assigned reference (`uuid`).
    pub exchange_uuid: Option<String>,
    pub market: MarketCode,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Requested volume; `None` for quote-amount market buys.
    pub requested_volume: Option<Size>,
    /// Limit price, or quote amount for `Price` orders.
    pub price: Option<Price>,
    pub state: OrderState,
    pub accepted_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    /// Cumulative executed volume.
    pub filled: Size,
    /// Volume-weighted average execution price.
    pub avg_fill_price: Option<Price>,
    pub retry_count: u32,
    pub lineage: Option<Lineage>,
    pub externally_adopted: bool,
    /// Exchange trade ids already folded into `filled`.
    #[serde(skip)]
    pub applied_trades: HashSet<String>,
    /// Anomalies recorded instead of raised.
    pub diagnostics: Vec<String>,
}

impl Order {
    /// New order in `Accepted` right after a successful acknowledgement.
    #[must_use]
    pub fn accepted(
        identifier: ClientOrderId,
        request: &OrderRequest,
        exchange_uuid: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier,
            exchange_uuid,
            market: request.market.clone(),
            side: request.side,
            kind: request.kind,
            requested_volume: request.volume,
            price: request.price,
            state: OrderState::Accepted,
            accepted_at: now,
            last_event_at: now,
            filled: Size::ZERO,
            avg_fill_price: None,
            retry_count: 0,
            lineage: None,
            externally_adopted: false,
            applied_trades: HashSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Unfilled volume, if the requested volume is known.
    #[must_use]
    pub fn remaining(&self) -> Option<Size> {
        self.requested_volume
            .map(|requested| requested.saturating_sub(self.filled))
    }

    /// Root identifier of this order's lineage (itself if never resubmitted).
    #[must_use]
    pub fn root_identifier(&self) -> &ClientOrderId {
        self.lineage
            .as_ref()
            .map(|l| &l.root)
            .unwrap_or(&self.identifier)
    }

    /// The request that would recreate this order's unfilled part.
    #[must_use]
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            market: self.market.clone(),
            side: self.side,
            kind: self.kind,
            volume: self.requested_volume,
            price: self.price,
            stop_reference: None,
        }
    }

    pub fn record_diagnostic(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
    }
}
