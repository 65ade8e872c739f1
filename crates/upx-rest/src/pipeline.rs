//! Authenticated, throttled request pipeline.
//!
//! `call(endpoint, params)` is the only way a REST request reaches the
//! exchange. Each attempt takes a throttle slot, gets a fresh nonce and
//! signature, and its response refreshes the group's quota. Failures are
//! mapped into `RestError` once the retry budgets are spent.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use upx_telemetry::Metrics;

use crate::auth::{mask_bearer, JwtSigner};
use crate::error::{parse_error_body, RestError, RestResult};
use crate::nonce::{Clock, NonceManager, SystemClock};
use crate::query::QueryParams;
use crate::throttle::{RemainingReq, Throttle, ThrottleConfig, ThrottleGroup};
use crate::transport::{DynHttpTransport, HttpMethod, HttpRequest, HttpResponse};

// ============================================================================
// Endpoints
// ============================================================================

/// One REST endpoint: method, path and throttle group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub method: HttpMethod,
    pub path: &'static str,
    pub group: ThrottleGroup,
    pub signed: bool,
}

impl Endpoint {
    pub const ACCOUNTS: Endpoint = Endpoint {
        name: "accounts",
        method: HttpMethod::Get,
        path: "/v1/accounts",
        group: ThrottleGroup::Account,
        signed: true,
    };

    pub const MARKETS: Endpoint = Endpoint {
        name: "markets",
        method: HttpMethod::Get,
        path: "/v1/market/all",
        group: ThrottleGroup::MarketData,
        signed: false,
    };

    pub const TICKER: Endpoint = Endpoint {
        name: "ticker",
        method: HttpMethod::Get,
        path: "/v1/ticker",
        group: ThrottleGroup::MarketData,
        signed: false,
    };

    pub const PLACE_ORDER: Endpoint = Endpoint {
        name: "place_order",
        method: HttpMethod::Post,
        path: "/v1/orders",
        group: ThrottleGroup::Order,
        signed: true,
    };

    pub const GET_ORDER: Endpoint = Endpoint {
        name: "get_order",
        method: HttpMethod::Get,
        path: "/v1/order",
        group: ThrottleGroup::OrderQuery,
        signed: true,
    };

    pub const CANCEL_ORDER: Endpoint = Endpoint {
        name: "cancel_order",
        method: HttpMethod::Delete,
        path: "/v1/order",
        group: ThrottleGroup::OrderQuery,
        signed: true,
    };

    pub const OPEN_ORDERS: Endpoint = Endpoint {
        name: "open_orders",
        method: HttpMethod::Get,
        path: "/v1/orders/open",
        group: ThrottleGroup::OrderQuery,
        signed: true,
    };
}

// ============================================================================
// Retry configuration
// ============================================================================

/// Retry budgets of the pipeline.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after 429/418.
    pub rate_limit_retries: u32,
    /// Backoff base after 429/418, doubled per attempt.
    pub rate_limit_base: Duration,
    /// Retries after network errors and 5xx.
    pub transient_retries: u32,
    pub transient_base: Duration,
    pub transient_cap: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_retries: 3,
            rate_limit_base: Duration::from_secs(1),
            transient_retries: 2,
            transient_base: Duration::from_millis(500),
            transient_cap: Duration::from_secs(8),
        }
    }
}

/// `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(cap)
}

/// Upper bound for a 429 backoff without `Retry-After`.
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);

// ============================================================================
// Pipeline
// ============================================================================

/// Request pipeline owning the nonce counter and throttle for one account.
pub struct RestPipeline<C: Clock = SystemClock> {
    transport: DynHttpTransport,
    signer: Option<JwtSigner>,
    nonce: NonceManager<C>,
    throttle: Throttle,
    retry: RetryConfig,
}

impl RestPipeline<SystemClock> {
    /// Pipeline using the system clock for nonces.
    ///
    /// Without a signer only public endpoints can be called.
    pub fn new(
        transport: DynHttpTransport,
        signer: Option<JwtSigner>,
        throttle: ThrottleConfig,
    ) -> Self {
        Self::with_clock(transport, signer, throttle, SystemClock)
    }
}

impl<C: Clock> RestPipeline<C> {
    pub fn with_clock(
        transport: DynHttpTransport,
        signer: Option<JwtSigner>,
        throttle: ThrottleConfig,
        clock: C,
    ) -> Self {
        Self {
            transport,
            signer,
            nonce: NonceManager::new(clock),
            throttle: Throttle::new(throttle),
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Last nonce handed to a signed request.
    pub fn last_nonce(&self) -> u64 {
        self.nonce.last()
    }

    /// `Authorization` header for the private stream handshake.
    ///
    /// Draws from the same nonce counter as signed REST calls.
    pub fn stream_authorization(&self) -> RestResult<String> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            RestError::MissingCredentials("private stream requires credentials".to_string())
        })?;
        signer.authorization(self.nonce.next(), None)
    }

    /// Call `endpoint` and decode the JSON response.
    pub async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        params: &QueryParams,
    ) -> RestResult<T> {
        let body = self.call_raw(endpoint, params).await?;
        serde_json::from_str(&body)
            .map_err(|e| RestError::Decode(format!("{}: {e}", endpoint.name)))
    }

    /// Call `endpoint` and return the raw success body.
    pub async fn call_raw(&self, endpoint: &Endpoint, params: &QueryParams) -> RestResult<String> {
        let group = endpoint.group;
        let mut rate_limit_attempt = 0u32;
        let mut transient_attempt = 0u32;

        loop {
            let waited = self.throttle.acquire(group).await;
            Metrics::throttle_wait(group.as_str(), waited.as_secs_f64() * 1000.0);

            let request = self.build_request(endpoint, params)?;
            let started = Instant::now();
            let outcome = self.transport.execute(request).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    Metrics::rest_request(group.as_str(), "network", latency_ms);
                    let retryable = endpoint.method.is_idempotent() || !err.sent;
                    if retryable && transient_attempt < self.retry.transient_retries {
                        let delay = self.transient_delay(transient_attempt);
                        transient_attempt += 1;
                        warn!(
                            endpoint = endpoint.name,
                            error = %err.message,
                            attempt = transient_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Network error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RestError::TransientNetwork {
                        endpoint: endpoint.name.to_string(),
                        message: err.message,
                        maybe_sent: err.sent,
                    });
                }
            };

            if let Some(remaining) = response.header("remaining-req").and_then(RemainingReq::parse)
            {
                self.throttle.observe(group, &remaining);
            }
            Metrics::rest_request(group.as_str(), &response.status.to_string(), latency_ms);

            match response.status {
                200..=299 => return Ok(response.body),
                429 | 418 => {
                    let retry_after = retry_after_secs(&response);
                    Metrics::rate_limit_backoff(group.as_str(), response.status);
                    if rate_limit_attempt >= self.retry.rate_limit_retries {
                        return Err(RestError::RateLimitExceeded {
                            group,
                            status: response.status,
                            retry_after_secs: retry_after,
                        });
                    }
                    let delay = retry_after.map(Duration::from_secs).unwrap_or_else(|| {
                        backoff_delay(self.retry.rate_limit_base, rate_limit_attempt, RATE_LIMIT_CAP)
                    });
                    rate_limit_attempt += 1;

                    if response.status == 418 {
                        error!(
                            endpoint = endpoint.name,
                            %group,
                            delay_secs = delay.as_secs(),
                            "Client banned by exchange (418), backing off"
                        );
                    } else {
                        warn!(
                            endpoint = endpoint.name,
                            %group,
                            attempt = rate_limit_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Rate limited (429), backing off"
                        );
                    }
                    // Concurrent callers of the same group wait too.
                    self.throttle.block_until(group, Instant::now() + delay);
                    continue;
                }
                401 => {
                    let (name, message) = parse_error_body(&response.body);
                    error!(endpoint = endpoint.name, %name, "Authentication rejected");
                    return Err(RestError::Authentication { name, message });
                }
                status if status < 500 => {
                    let (name, message) = parse_error_body(&response.body);
                    debug!(endpoint = endpoint.name, status, %name, %message, "Request rejected");
                    return Err(RestError::Validation {
                        status,
                        name,
                        message,
                    });
                }
                status => {
                    let (name, message) = parse_error_body(&response.body);
                    if endpoint.method.is_idempotent()
                        && transient_attempt < self.retry.transient_retries
                    {
                        let delay = self.transient_delay(transient_attempt);
                        transient_attempt += 1;
                        warn!(
                            endpoint = endpoint.name,
                            status,
                            %name,
                            attempt = transient_attempt,
                            "Server error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RestError::TransientNetwork {
                        endpoint: endpoint.name.to_string(),
                        message: format!("{status} {name}: {message}"),
                        maybe_sent: true,
                    });
                }
            }
        }
    }

    fn transient_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.retry.transient_base, attempt, self.retry.transient_cap)
    }

    fn build_request(&self, endpoint: &Endpoint, params: &QueryParams) -> RestResult<HttpRequest> {
        let mut headers = Vec::new();

        if endpoint.signed {
            let signer = self.signer.as_ref().ok_or_else(|| {
                RestError::MissingCredentials(format!("{} requires credentials", endpoint.name))
            })?;
            let query = params.to_query_string();
            let nonce = self.nonce.next();
            let authorization = signer.authorization(nonce, Some(&query))?;
            debug!(
                endpoint = endpoint.name,
                nonce,
                authorization = %mask_bearer(&authorization),
                "Signed request"
            );
            headers.push(("Authorization".to_string(), authorization));
        }

        let body = match endpoint.method {
            HttpMethod::Post => Some(params.to_json_body()),
            HttpMethod::Get | HttpMethod::Delete => None,
        };

        Ok(HttpRequest {
            method: endpoint.method,
            path: endpoint.path.to_string(),
            params: params.pairs().to_vec(),
            body,
            headers,
        })
    }
}

fn retry_after_secs(response: &HttpResponse) -> Option<u64> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
}
