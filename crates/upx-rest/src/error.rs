//! REST pipeline error types.

use serde::Deserialize;
use thiserror::Error;

use crate::throttle::ThrottleGroup;

/// Typed failure surfaced by the pipeline once its retry budgets are spent.
#[derive(Debug, Clone, Error)]
pub enum RestError {
    /// Network failure or 5xx. `maybe_sent` is true when the exchange may
    /// have processed the request.
    #[error("Transient network error on {endpoint}: {message}")]
    TransientNetwork {
        endpoint: String,
        message: String,
        maybe_sent: bool,
    },

    #[error("Rate limit exceeded for {group} (status {status})")]
    RateLimitExceeded {
        group: ThrottleGroup,
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("Authentication failed: {name}: {message}")]
    Authentication { name: String, message: String },

    #[error("Request rejected ({status}): {name}: {message}")]
    Validation {
        status: u16,
        name: String,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Response decode failed: {0}")]
    Decode(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),
}

impl RestError {
    /// Exchange reported the referenced resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Validation { status: 404, .. })
            || matches!(self, Self::Validation { name, .. } if name.ends_with("not_found"))
    }

    /// The request may or may not have taken effect.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::TransientNetwork { maybe_sent: true, .. })
    }

    /// Fatal for the process: credentials are wrong or missing.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::MissingCredentials(_))
    }

    /// Label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } => "transient_network",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Authentication { .. } => "authentication",
            Self::Validation { .. } | Self::InvalidRequest(_) => "validation",
            Self::Decode(_) => "decode",
            Self::HttpClient(_) => "http_client",
            Self::Signing(_) => "signing",
            Self::MissingCredentials(_) => "missing_credentials",
        }
    }
}

pub type RestResult<T> = Result<T, RestError>;

/// `{ "error": { "name": ..., "message": ... } }`
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub name: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Extract `(name, message)` from an error body, falling back to the raw text.
pub(crate) fn parse_error_body(body: &str) -> (String, String) {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let name = match envelope.error.name {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "unknown".to_string(),
            };
            (name, envelope.error.message.unwrap_or_default())
        }
        Err(_) => ("unknown".to_string(), body.chars().take(200).collect()),
    }
}
