//! Error types for upx-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid market code: {0}")]
    InvalidMarket(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Ledger write failed: {0}")]
    Ledger(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
