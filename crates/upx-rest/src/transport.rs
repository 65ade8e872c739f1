//! HTTP transport seam.
//!
//! The pipeline speaks to the network through `HttpTransport` so retry,
//! throttle and status mapping can be exercised against a scripted transport.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{RestError, RestResult};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Connect timeout for every REST call.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Total timeout for every REST call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Production REST base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.upbit.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    /// Whether repeating the request cannot create a second effect.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get)
    }
}

/// Request handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    /// Query pairs (GET/DELETE) or JSON body fields (POST).
    pub params: Vec<(String, String)>,
    /// JSON body for POST requests.
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

/// Response as seen by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Transport-level failure.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub message: String,
    /// False only when the request provably never left the client.
    pub sent: bool,
}

/// Sends HTTP requests.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;
}

/// Arc wrapper for HttpTransport trait objects.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

// ============================================================================
// reqwest implementation
// ============================================================================

/// `reqwest`-backed transport with bounded timeouts.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> RestResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RestError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path);
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&url).query(&request.params),
                HttpMethod::Delete => self.client.delete(&url).query(&request.params),
                HttpMethod::Post => {
                    let body = request.body.clone().unwrap_or(serde_json::Value::Null);
                    self.client.post(&url).json(&body)
                }
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder.send().await.map_err(classify_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                })
                .collect();
            let body = response.text().await.map_err(|e| TransportError {
                message: format!("reading body: {e}"),
                sent: true,
            })?;

            trace!(status, path = %request.path, "HTTP response");
            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    TransportError {
        sent: !(e.is_connect() || e.is_builder()),
        message: e.to_string(),
    }
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Transport that replays queued outcomes and records every request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn push_response(&self, status: u16, body: &str, headers: &[(&str, &str)]) {
        self.outcomes.lock().push_back(Ok(HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            body: body.to_string(),
        }));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: &str, sent: bool) {
        self.outcomes.lock().push_back(Err(TransportError {
            message: message.to_string(),
            sent,
        }));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            self.requests.lock().push(request);
            self.outcomes.lock().pop_front().unwrap_or_else(|| {
                Err(TransportError {
                    message: "no scripted response".to_string(),
                    sent: false,
                })
            })
        })
    }
}
