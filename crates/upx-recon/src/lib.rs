//! Reconciliation of local order and balance state against the exchange.
//!
//! - `Reconciler`: snapshot diff, finalization of vanished orders, adoption
//!   of unknown ones, balance mismatch notification
//! - `Portfolio`: balances pushed by the `myAsset` stream
//! - `BalanceTolerance`: absolute plus relative drift allowance

pub mod balance;
pub mod error;
pub mod portfolio;
pub mod reconciler;

pub use balance::{compare_balances, BalanceMismatch, BalanceTolerance};
pub use error::{ReconError, ReconResult};
pub use portfolio::{pump_assets, Portfolio};
pub use reconciler::{
    ReconConfig, Reconciler, SweepReport, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_RECON_INTERVAL_SECS,
};
