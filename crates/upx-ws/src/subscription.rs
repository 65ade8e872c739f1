//! Subscription set.
//!
//! Each subscription is one `(channel, markets, encoding)` tuple. Its request
//! payload is rendered once, with its own ticket, when it is added and then
//! replayed byte for byte after every reconnect.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use upx_core::MarketCode;

use crate::error::{WsError, WsResult};

/// Stream channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Ticker,
    Trade,
    Orderbook,
    MyOrder,
    MyAsset,
}

impl Channel {
    /// Wire name (`type` field).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::Orderbook => "orderbook",
            Self::MyOrder => "myOrder",
            Self::MyAsset => "myAsset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ticker" => Some(Self::Ticker),
            "trade" => Some(Self::Trade),
            "orderbook" => Some(Self::Orderbook),
            "myOrder" => Some(Self::MyOrder),
            "myAsset" => Some(Self::MyAsset),
            _ => None,
        }
    }

    /// Channels served only on the authenticated endpoint.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::MyOrder | Self::MyAsset)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame encoding negotiated per subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    /// Verbose field names.
    Default,
    /// Abbreviated field names.
    #[default]
    Simple,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Simple => "SIMPLE",
        }
    }
}

/// One subscription tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub channel: Channel,
    /// Sorted, deduplicated. Empty for `myAsset`, and for `myOrder` means all
    /// markets.
    pub markets: Vec<MarketCode>,
    pub encoding: Encoding,
}

impl Subscription {
    pub fn new(channel: Channel, markets: impl IntoIterator<Item = MarketCode>, encoding: Encoding) -> Self {
        let mut markets: Vec<MarketCode> = markets.into_iter().collect();
        markets.sort();
        markets.dedup();
        Self {
            channel,
            markets,
            encoding,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            channel: self.channel,
            markets: self
                .markets
                .iter()
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>()
                .join(","),
            encoding: self.encoding,
        }
    }

    fn validate(&self) -> WsResult<()> {
        match self.channel {
            Channel::MyAsset if !self.markets.is_empty() => Err(WsError::SubscriptionError(
                "myAsset takes no market codes".to_string(),
            )),
            Channel::Ticker | Channel::Trade | Channel::Orderbook if self.markets.is_empty() => {
                Err(WsError::SubscriptionError(format!(
                    "{} needs at least one market",
                    self.channel
                )))
            }
            _ => Ok(()),
        }
    }

    /// Request payload under `ticket`.
    pub fn request_payload(&self, ticket: &str) -> String {
        let mut body = serde_json::Map::new();
        body.insert("type".to_string(), json!(self.channel.as_str()));
        if self.channel != Channel::MyAsset {
            let codes: Vec<&str> = self.markets.iter().map(MarketCode::as_str).collect();
            body.insert("codes".to_string(), json!(codes));
        }
        body.insert("isOnlyRealtime".to_string(), json!(true));

        json!([
            { "ticket": ticket },
            serde_json::Value::Object(body),
            { "format": self.encoding.as_str() }
        ])
        .to_string()
    }
}

/// Identity of a subscription inside the set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    pub channel: Channel,
    pub markets: String,
    pub encoding: Encoding,
}

#[derive(Debug, Clone)]
struct StoredSubscription {
    subscription: Subscription,
    payload: String,
}

/// Ordered set of active subscriptions with their rendered payloads.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    entries: BTreeMap<SubscriptionKey, StoredSubscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns its payload if it was not present yet.
    pub fn insert(&mut self, subscription: Subscription) -> WsResult<Option<String>> {
        subscription.validate()?;
        let key = subscription.key();
        if self.entries.contains_key(&key) {
            return Ok(None);
        }
        let ticket = format!("upx-{}", uuid::Uuid::new_v4());
        let payload = subscription.request_payload(&ticket);
        self.entries.insert(
            key,
            StoredSubscription {
                subscription,
                payload: payload.clone(),
            },
        );
        Ok(Some(payload))
    }

    /// Remove a subscription. Returns true if it was present.
    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        self.entries.remove(&subscription.key()).is_some()
    }

    /// Payloads in replay order.
    pub fn payloads(&self) -> Vec<String> {
        self.entries.values().map(|s| s.payload.clone()).collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.entries.values().map(|s| s.subscription.clone()).collect()
    }

    pub fn has_private(&self) -> bool {
        self.entries.keys().any(|k| k.channel.is_private())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
