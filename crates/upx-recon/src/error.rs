//! Reconciliation error types.

use thiserror::Error;
use upx_rest::RestError;

#[derive(Debug, Error)]
pub enum ReconError {
    /// The authoritative snapshot could not be fetched; nothing was diffed.
    #[error("Snapshot fetch failed: {0}")]
    Snapshot(#[from] RestError),
}

pub type ReconResult<T> = Result<T, ReconError>;
