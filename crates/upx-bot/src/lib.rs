//! Upbit execution engine application.
//!
//! Orchestrates the engine components:
//! - Signed REST pipeline and exchange client
//! - Private order/asset stream and optional market-data stream
//! - Order state machine and timeout monitor
//! - Reconciliation loop and balance checks
//! - Log notifier and JSON Lines audit ledger

pub mod app;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notifier;

pub use app::{Application, Collaborators, Engine};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use ledger::JsonlLedger;
pub use notifier::LogNotifier;
