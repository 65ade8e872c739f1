//! Order lifecycle management for the upx execution engine.
//!
//! - `OrderStateMachine`: submit, idempotent event folding, timeouts,
//!   resubmission with lineage, reconciliation hooks
//! - `TimeoutPolicy`: pluggable decision for timed-out orders
//! - `IdGenerator`: `upx-<epoch-ms>-<seq>` identifiers with `-r<n>` retries
//! - `OrderStore`: per-order locked cells in a `DashMap`
//! - `TimeoutMonitor`: periodic timeout detection and resolution

pub mod error;
pub mod ids;
pub mod machine;
pub mod monitor;
pub mod policy;
pub mod store;

pub use error::{OrderError, OrderResult};
pub use ids::{IdGenerator, DEFAULT_ID_PREFIX};
pub use machine::{
    lookup_for, OrderConfig, OrderStateMachine, DEFAULT_MIN_NOTIONAL, DEFAULT_MONITOR_INTERVAL_MS,
    DEFAULT_ORDER_TIMEOUT_SECS,
};
pub use monitor::{pump_events, TimeoutMonitor};
pub use policy::{DynTimeoutPolicy, StandardTimeoutPolicy, TimeoutDecision, TimeoutPolicy};
pub use store::{InDoubtSubmission, OrderCell, OrderStore, Routed, DEFAULT_RECENT_CAPACITY};
