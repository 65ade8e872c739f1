//! Core domain types for the upx execution engine.
//!
//! This crate provides the types shared by every component:
//! - `MarketCode`: Exchange market identifier (`KRW-BTC`)
//! - `Price`, `Size`: Precision-safe numeric types
//! - `OrderRequest`, `Order`, `OrderState`: Order intent and lifecycle
//! - `OrderEvent`, `AssetBalance`: Normalized exchange updates
//! - `Notifier`, `AuditLedger`: Collaborator seams

pub mod decimal;
pub mod error;
pub mod event;
pub mod execution;
pub mod lifecycle;
pub mod market;
pub mod order;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use event::{AssetBalance, ExchangeOrderStatus, OrderEvent, TradeFill};
pub use execution::{Lineage, Order, OrderState};
pub use lifecycle::{
    AuditLedger, DynLedger, DynNotifier, LedgerEntry, LifecycleEvent, MemoryLedger,
    MemoryNotifier, Notifier,
};
pub use market::{krw_tick_size, MarketCode};
pub use order::{
    ClientOrderId, Decision, OrderKind, OrderRequest, OrderSide, PriceInstruction, Quantity,
    Sizing,
};
