//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("REST error: {0}")]
    Rest(#[from] upx_rest::RestError),

    #[error("Stream error: {0}")]
    Stream(#[from] upx_ws::WsError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] upx_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
