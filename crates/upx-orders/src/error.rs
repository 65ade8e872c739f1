//! Order state machine error types.

use thiserror::Error;
use upx_core::ClientOrderId;
use upx_rest::RestError;

#[derive(Debug, Error)]
pub enum OrderError {
    /// Rejected before any network call.
    #[error("Order validation failed: {0}")]
    Validation(String),

    #[error("Exchange request failed: {0}")]
    Rest(#[from] RestError),

    /// The submission may have reached the exchange; reconciliation decides.
    #[error("Submission of {0} is in doubt")]
    InDoubt(ClientOrderId),

    #[error("Order not tracked: {0}")]
    NotFound(ClientOrderId),

    #[error("Order {identifier} cannot be resolved from {state}")]
    InvalidState {
        identifier: ClientOrderId,
        state: String,
    },
}

pub type OrderResult<T> = Result<T, OrderError>;
