//! Authenticated, throttled REST access to the exchange.
//!
//! - `NonceManager`: strictly increasing nonces, robust to clock rollback
//! - `JwtSigner`: HS512 bearer tokens with query hashes
//! - `Throttle`: per-group budgets fed by `Remaining-Req`
//! - `RestPipeline`: the single call path with retry and error mapping
//! - `ExchangeClient` / `ExchangeGateway`: typed endpoints and the seam the
//!   order and reconciliation layers depend on

pub mod auth;
pub mod client;
pub mod error;
pub mod gateway;
pub mod nonce;
pub mod pipeline;
pub mod query;
pub mod throttle;
pub mod transport;

pub use auth::{mask_bearer, query_hash, Credentials, JwtSigner};
pub use client::{ExchangeClient, MarketInfo, OrderLookup, OrderResponse, Ticker};
pub use error::{RestError, RestResult};
pub use gateway::{DynGateway, ExchangeGateway, MockGateway};
pub use nonce::{Clock, NonceManager, SystemClock};
pub use pipeline::{backoff_delay, Endpoint, RestPipeline, RetryConfig};
pub use query::QueryParams;
pub use throttle::{RemainingReq, Throttle, ThrottleConfig, ThrottleGroup};
pub use transport::{
    BoxFuture, DynHttpTransport, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, ScriptedTransport, TransportError, DEFAULT_BASE_URL,
};
