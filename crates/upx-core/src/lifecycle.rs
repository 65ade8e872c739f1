//! Lifecycle notifications and the audit ledger seam.
//!
//! The notifier and the ledger are owned by collaborators outside the engine.
//! The engine only calls `notify` and `append`; both must return quickly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{Price, Size};
use crate::error::Result;
use crate::execution::{Order, OrderState};
use crate::market::MarketCode;
use crate::order::{ClientOrderId, OrderSide};

/// Structured lifecycle event for the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Submitted {
        identifier: ClientOrderId,
        market: MarketCode,
        side: OrderSide,
        exchange_uuid: Option<String>,
    },
    Filled {
        identifier: ClientOrderId,
        filled: Size,
        avg_price: Option<Price>,
    },
    Cancelled {
        identifier: ClientOrderId,
        filled: Size,
        reason: String,
    },
    TimedOut {
        identifier: ClientOrderId,
        idle_secs: i64,
    },
    Escalated {
        identifier: ClientOrderId,
        reason: String,
    },
    AdoptedExternally {
        identifier: ClientOrderId,
        exchange_uuid: Option<String>,
        market: MarketCode,
    },
    BalanceMismatch {
        currency: String,
        tracked: Decimal,
        exchange: Decimal,
    },
    PersistentFailure {
        context: String,
        error: String,
    },
}

impl LifecycleEvent {
    /// Short name used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submitted { .. } => "submitted",
            Self::Filled { .. } => "filled",
            Self::Cancelled { .. } => "cancelled",
            Self::TimedOut { .. } => "timed_out",
            Self::Escalated { .. } => "escalated",
            Self::AdoptedExternally { .. } => "adopted_externally",
            Self::BalanceMismatch { .. } => "balance_mismatch",
            Self::PersistentFailure { .. } => "persistent_failure",
        }
    }
}

/// Receives lifecycle events.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &LifecycleEvent);
}

/// Arc wrapper for Notifier trait objects.
pub type DynNotifier = Arc<dyn Notifier>;

/// Append-only record of one terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identifier: ClientOrderId,
    pub state: OrderState,
    pub order: Order,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    #[must_use]
    pub fn from_order(order: &Order, recorded_at: DateTime<Utc>) -> Self {
        Self {
            identifier: order.identifier.clone(),
            state: order.state,
            order: order.clone(),
            recorded_at,
        }
    }
}

/// Persists terminal transitions.
pub trait AuditLedger: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<()>;
}

/// Arc wrapper for AuditLedger trait objects.
pub type DynLedger = Arc<dyn AuditLedger>;

// ============================================================================
// In-memory implementations
// ============================================================================

/// Notifier that records every event. Used in tests and dry runs.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Ledger that keeps entries in memory.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }
}

impl AuditLedger for MemoryLedger {
    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}
