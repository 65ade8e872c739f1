//! Application configuration.
//!
//! Loaded from a TOML file; every section has defaults so a minimal file
//! (or none at all) yields a runnable engine. API keys are read from the
//! `[credentials]` section when present, from the environment otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use upx_core::MarketCode;
use upx_orders::OrderConfig;
use upx_recon::ReconConfig;
use upx_rest::{Credentials, ThrottleConfig, DEFAULT_BASE_URL};
use upx_ws::{
    Channel, Encoding, StreamConfig, Subscription, DEFAULT_HANDLER_CAPACITY, PRIVATE_URL,
    PUBLIC_URL,
};

use crate::error::{AppError, AppResult};

// ============================================================================
// REST
// ============================================================================

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// REST pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            throttle: ThrottleConfig::default(),
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

fn default_public_url() -> String {
    PUBLIC_URL.to_string()
}

fn default_private_url() -> String {
    PRIVATE_URL.to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60000
}

fn default_channel_capacity() -> usize {
    DEFAULT_HANDLER_CAPACITY
}

/// One public market-data subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub channel: Channel,
    pub codes: Vec<String>,
    #[serde(default)]
    pub encoding: Encoding,
}

/// Streaming client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default = "default_private_url")]
    pub private_url: String,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Seconds without any inbound frame before the connection is recycled.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Encoding of the `myOrder`/`myAsset` subscriptions.
    #[serde(default)]
    pub private_encoding: Encoding,

    /// Capacity of each handler channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Public market-data subscriptions. Empty disables the public stream.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            public_url: default_public_url(),
            private_url: default_private_url(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            private_encoding: Encoding::default(),
            channel_capacity: default_channel_capacity(),
            subscriptions: Vec::new(),
        }
    }
}

impl StreamSettings {
    /// Client configuration for the endpoint at `url`.
    pub fn client_config(&self, url: &str) -> StreamConfig {
        StreamConfig {
            url: url.to_string(),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
        }
    }

    /// `myOrder` and `myAsset` subscriptions for the private endpoint.
    pub fn private_subscriptions(&self) -> Vec<Subscription> {
        vec![
            Subscription::new(Channel::MyOrder, [], self.private_encoding),
            Subscription::new(Channel::MyAsset, [], self.private_encoding),
        ]
    }

    /// Configured public subscriptions with parsed market codes.
    pub fn public_subscriptions(&self) -> AppResult<Vec<Subscription>> {
        self.subscriptions
            .iter()
            .map(|sub| {
                let markets = sub
                    .codes
                    .iter()
                    .map(|code| {
                        MarketCode::new(code.as_str())
                            .map_err(|e| AppError::Config(format!("market code {code}: {e}")))
                    })
                    .collect::<AppResult<Vec<_>>>()?;
                Ok(Subscription::new(sub.channel, markets, sub.encoding))
            })
            .collect()
    }
}

// ============================================================================
// Ledger and credentials
// ============================================================================

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger.jsonl")
}

/// Audit ledger location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

/// API keys given in the file. The secret is never serialized back out.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub access_key: String,
    #[serde(skip_serializing, default)]
    pub secret_key: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"****")
            .finish()
    }
}

// ============================================================================
// AppConfig
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub orders: OrderConfig,

    #[serde(default)]
    pub recon: ReconConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let orders = &self.orders;
        if orders.id_prefix.is_empty() || !orders.id_prefix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(AppError::Config(format!(
                "orders.id_prefix ({:?}) must be non-empty ASCII alphanumeric",
                orders.id_prefix
            )));
        }
        if orders.min_notional.is_sign_negative() {
            return Err(AppError::Config(format!(
                "orders.min_notional ({}) must be non-negative",
                orders.min_notional
            )));
        }
        if orders.order_timeout_secs == 0 {
            return Err(AppError::Config(
                "orders.order_timeout_secs must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("orders.partial_fill_timeout_scale", orders.partial_fill_timeout_scale),
            ("orders.partial_fill_reduce_ratio", orders.partial_fill_reduce_ratio),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(AppError::Config(format!(
                    "{name} ({value}) must be in (0, 1]"
                )));
            }
        }

        let throttle = &self.rest.throttle;
        for (name, per_sec) in [
            ("order_per_sec", throttle.order_per_sec),
            ("order_query_per_sec", throttle.order_query_per_sec),
            ("account_per_sec", throttle.account_per_sec),
            ("market_data_per_sec", throttle.market_data_per_sec),
        ] {
            if per_sec <= throttle.safety_margin {
                return Err(AppError::Config(format!(
                    "rest.throttle.{name} ({per_sec}) must exceed safety_margin ({})",
                    throttle.safety_margin
                )));
            }
        }

        let stream = &self.stream;
        if stream.ping_interval_secs == 0 || stream.ping_interval_secs >= stream.idle_timeout_secs {
            return Err(AppError::Config(format!(
                "stream.ping_interval_secs ({}) must be positive and below idle_timeout_secs ({})",
                stream.ping_interval_secs, stream.idle_timeout_secs
            )));
        }
        if stream.reconnect_base_delay_ms > stream.reconnect_max_delay_ms {
            return Err(AppError::Config(format!(
                "stream.reconnect_base_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                stream.reconnect_base_delay_ms, stream.reconnect_max_delay_ms
            )));
        }
        if stream.channel_capacity == 0 {
            return Err(AppError::Config(
                "stream.channel_capacity must be positive".to_string(),
            ));
        }
        for sub in &stream.subscriptions {
            if sub.channel.is_private() {
                return Err(AppError::Config(format!(
                    "stream.subscriptions: {} is subscribed automatically on the private stream",
                    sub.channel
                )));
            }
            if sub.codes.is_empty() {
                return Err(AppError::Config(format!(
                    "stream.subscriptions: {} needs at least one market code",
                    sub.channel
                )));
            }
        }
        stream.public_subscriptions()?;

        let tolerance = &self.recon.balance_tolerance;
        if tolerance.absolute.is_sign_negative() || tolerance.relative.is_sign_negative() {
            return Err(AppError::Config(
                "recon.balance_tolerance must be non-negative".to_string(),
            ));
        }

        Ok(())
    }

    /// API keys from the file, falling back to the environment.
    pub fn credentials(&self) -> AppResult<Credentials> {
        match &self.credentials {
            Some(c) if !c.access_key.is_empty() && !c.secret_key.is_empty() => {
                Ok(Credentials::new(c.access_key.trim(), c.secret_key.trim()))
            }
            _ => Ok(Credentials::from_env()?),
        }
    }
}
