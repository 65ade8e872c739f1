//! Stream frame normalization.
//!
//! Frames arrive in either the verbose (`DEFAULT`) or the compact (`SIMPLE`)
//! encoding. Compact keys are expanded to their verbose names first, so each
//! frame type has exactly one wire struct and one conversion into the
//! normalized types handlers consume.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use upx_core::{
    AssetBalance, ClientOrderId, ExchangeOrderStatus, MarketCode, OrderEvent, OrderKind,
    OrderSide, Price, Size, TradeFill,
};

use crate::error::{WsError, WsResult};
use crate::subscription::Channel;

// ============================================================================
// Normalized frames
// ============================================================================

/// Ticker update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerFrame {
    pub market: MarketCode,
    pub trade_price: Price,
    pub signed_change_rate: Option<Decimal>,
    pub acc_trade_volume_24h: Option<Size>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Public trade print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFrame {
    pub market: MarketCode,
    pub price: Price,
    pub volume: Size,
    pub side: Option<OrderSide>,
    pub sequential_id: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One orderbook level pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookUnit {
    pub ask_price: Price,
    pub bid_price: Price,
    pub ask_size: Size,
    pub bid_size: Size,
}

/// Orderbook snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookFrame {
    pub market: MarketCode,
    pub total_ask_size: Option<Size>,
    pub total_bid_size: Option<Size>,
    pub units: Vec<OrderbookUnit>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Balance update for one or more currencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSnapshot {
    pub assets: Vec<AssetBalance>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Every frame the stream can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Ticker(TickerFrame),
    Trade(TradeFrame),
    Orderbook(OrderbookFrame),
    MyOrder(OrderEvent),
    MyAsset(AssetSnapshot),
    /// Server keepalive (`{"status":"UP"}`).
    Status(String),
}

impl StreamFrame {
    /// Account frames (`myOrder`, `myAsset`). Losing one leaves local state
    /// behind the exchange.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::MyOrder(_) | Self::MyAsset(_))
    }

    /// Short name used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ticker(_) => "ticker",
            Self::Trade(_) => "trade",
            Self::Orderbook(_) => "orderbook",
            Self::MyOrder(_) => "my_order",
            Self::MyAsset(_) => "my_asset",
            Self::Status(_) => "status",
        }
    }
}

// ============================================================================
// Compact key tables
// ============================================================================

const COMMON_KEYS: &[(&str, &str)] = &[
    ("ty", "type"),
    ("cd", "code"),
    ("tms", "timestamp"),
    ("st", "stream_type"),
];

const TICKER_KEYS: &[(&str, &str)] = &[
    ("tp", "trade_price"),
    ("scr", "signed_change_rate"),
    ("atv24h", "acc_trade_volume_24h"),
];

const TRADE_KEYS: &[(&str, &str)] = &[
    ("tp", "trade_price"),
    ("tv", "trade_volume"),
    ("ab", "ask_bid"),
    ("sid", "sequential_id"),
    ("ttms", "trade_timestamp"),
];

const ORDERBOOK_KEYS: &[(&str, &str)] = &[
    ("tas", "total_ask_size"),
    ("tbs", "total_bid_size"),
    ("obu", "orderbook_units"),
];

const ORDERBOOK_UNIT_KEYS: &[(&str, &str)] = &[
    ("ap", "ask_price"),
    ("bp", "bid_price"),
    ("as", "ask_size"),
    ("bs", "bid_size"),
];

const MY_ORDER_KEYS: &[(&str, &str)] = &[
    ("uid", "uuid"),
    ("ab", "ask_bid"),
    ("ot", "order_type"),
    ("s", "state"),
    ("tuid", "trade_uuid"),
    ("p", "price"),
    ("ap", "avg_price"),
    ("v", "volume"),
    ("rv", "remaining_volume"),
    ("ev", "executed_volume"),
    ("tc", "trades_count"),
    ("id", "identifier"),
    ("ttms", "trade_timestamp"),
    ("otms", "order_timestamp"),
];

const MY_ASSET_KEYS: &[(&str, &str)] = &[
    ("astuid", "asset_uuid"),
    ("ast", "assets"),
    ("asttms", "asset_timestamp"),
];

const ASSET_UNIT_KEYS: &[(&str, &str)] = &[("cu", "currency"), ("b", "balance"), ("l", "locked")];

fn expand_keys(object: Map<String, Value>, tables: &[&[(&str, &str)]]) -> Map<String, Value> {
    object
        .into_iter()
        .map(|(key, value)| {
            let verbose = tables
                .iter()
                .flat_map(|table| table.iter())
                .find(|(short, _)| *short == key)
                .map(|(_, long)| (*long).to_string());
            (verbose.unwrap_or(key), value)
        })
        .collect()
}

fn expand_nested(object: &mut Map<String, Value>, field: &str, table: &[(&str, &str)]) {
    if let Some(Value::Array(items)) = object.get_mut(field) {
        for item in items.iter_mut() {
            if let Value::Object(inner) = std::mem::take(item) {
                *item = Value::Object(expand_keys(inner, &[table]));
            }
        }
    }
}

// ============================================================================
// Wire structs (verbose names)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawTicker {
    code: String,
    trade_price: Decimal,
    signed_change_rate: Option<Decimal>,
    acc_trade_volume_24h: Option<Decimal>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    code: String,
    trade_price: Decimal,
    trade_volume: Decimal,
    ask_bid: Option<String>,
    sequential_id: Option<u64>,
    trade_timestamp: Option<i64>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawOrderbookUnit {
    ask_price: Decimal,
    bid_price: Decimal,
    ask_size: Decimal,
    bid_size: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawOrderbook {
    code: String,
    total_ask_size: Option<Decimal>,
    total_bid_size: Option<Decimal>,
    #[serde(default)]
    orderbook_units: Vec<RawOrderbookUnit>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawMyOrder {
    code: Option<String>,
    uuid: Option<String>,
    ask_bid: Option<String>,
    order_type: Option<String>,
    state: String,
    trade_uuid: Option<String>,
    price: Option<Decimal>,
    avg_price: Option<Decimal>,
    volume: Option<Decimal>,
    remaining_volume: Option<Decimal>,
    executed_volume: Option<Decimal>,
    identifier: Option<String>,
    trade_timestamp: Option<i64>,
    order_timestamp: Option<i64>,
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    currency: String,
    balance: Decimal,
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawMyAsset {
    #[serde(default)]
    assets: Vec<RawAsset>,
    asset_timestamp: Option<i64>,
    timestamp: Option<i64>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse one inbound payload (text or binary).
///
/// Returns `Ok(None)` for payloads that carry no frame (unknown types).
pub fn parse_frame(payload: &[u8]) -> WsResult<Option<StreamFrame>> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(object) = value else {
        return Err(WsError::ParseError("frame is not a JSON object".to_string()));
    };

    if let Some(error) = object.get("error") {
        let name = error.get("name").and_then(Value::as_str).unwrap_or("unknown");
        let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(WsError::SubscriptionError(format!("{name}: {message}")));
    }
    if let Some(status) = object.get("status").and_then(Value::as_str) {
        return Ok(Some(StreamFrame::Status(status.to_string())));
    }

    let compact = object.contains_key("ty");
    let type_field = if compact { "ty" } else { "type" };
    let Some(channel) = object
        .get(type_field)
        .and_then(Value::as_str)
        .and_then(Channel::parse)
    else {
        return Ok(None);
    };

    let frame = match channel {
        Channel::Ticker => {
            let raw: RawTicker = decode(object, compact, TICKER_KEYS, None)?;
            StreamFrame::Ticker(TickerFrame {
                market: market(&raw.code)?,
                trade_price: Price::new(raw.trade_price),
                signed_change_rate: raw.signed_change_rate,
                acc_trade_volume_24h: raw.acc_trade_volume_24h.map(Size::new),
                timestamp: raw.timestamp.and_then(millis),
            })
        }
        Channel::Trade => {
            let raw: RawTrade = decode(object, compact, TRADE_KEYS, None)?;
            StreamFrame::Trade(TradeFrame {
                market: market(&raw.code)?,
                price: Price::new(raw.trade_price),
                volume: Size::new(raw.trade_volume),
                side: raw.ask_bid.as_deref().and_then(OrderSide::parse),
                sequential_id: raw.sequential_id,
                timestamp: raw.trade_timestamp.or(raw.timestamp).and_then(millis),
            })
        }
        Channel::Orderbook => {
            let raw: RawOrderbook = decode(
                object,
                compact,
                ORDERBOOK_KEYS,
                Some(("orderbook_units", ORDERBOOK_UNIT_KEYS)),
            )?;
            StreamFrame::Orderbook(OrderbookFrame {
                market: market(&raw.code)?,
                total_ask_size: raw.total_ask_size.map(Size::new),
                total_bid_size: raw.total_bid_size.map(Size::new),
                units: raw
                    .orderbook_units
                    .into_iter()
                    .map(|u| OrderbookUnit {
                        ask_price: Price::new(u.ask_price),
                        bid_price: Price::new(u.bid_price),
                        ask_size: Size::new(u.ask_size),
                        bid_size: Size::new(u.bid_size),
                    })
                    .collect(),
                timestamp: raw.timestamp.and_then(millis),
            })
        }
        Channel::MyOrder => {
            let raw: RawMyOrder = decode(object, compact, MY_ORDER_KEYS, None)?;
            StreamFrame::MyOrder(my_order_event(raw)?)
        }
        Channel::MyAsset => {
            let raw: RawMyAsset =
                decode(object, compact, MY_ASSET_KEYS, Some(("assets", ASSET_UNIT_KEYS)))?;
            StreamFrame::MyAsset(AssetSnapshot {
                assets: raw
                    .assets
                    .into_iter()
                    .map(|a| AssetBalance {
                        currency: a.currency,
                        balance: a.balance,
                        locked: a.locked,
                        avg_buy_price: Decimal::ZERO,
                    })
                    .collect(),
                timestamp: raw.asset_timestamp.or(raw.timestamp).and_then(millis),
            })
        }
    };
    Ok(Some(frame))
}

fn decode<T: serde::de::DeserializeOwned>(
    object: Map<String, Value>,
    compact: bool,
    keys: &[(&str, &str)],
    nested: Option<(&str, &[(&str, &str)])>,
) -> WsResult<T> {
    let object = if compact {
        let mut expanded = expand_keys(object, &[COMMON_KEYS, keys]);
        if let Some((field, table)) = nested {
            expand_nested(&mut expanded, field, table);
        }
        expanded
    } else {
        object
    };
    serde_json::from_value(Value::Object(object)).map_err(|e| WsError::ParseError(e.to_string()))
}

fn my_order_event(raw: RawMyOrder) -> WsResult<OrderEvent> {
    let status = ExchangeOrderStatus::parse(&raw.state);
    let market = raw.code.as_deref().map(market).transpose()?;

    // On a trade update `price`/`volume` describe the execution, not the order.
    let (price, volume, trade) = if status == ExchangeOrderStatus::Trade {
        let trade = match (raw.trade_uuid, raw.price, raw.volume) {
            (Some(trade_id), Some(price), Some(volume)) => Some(TradeFill {
                trade_id,
                price: Price::new(price),
                volume: Size::new(volume),
            }),
            _ => None,
        };
        (None, None, trade)
    } else {
        (raw.price.map(Price::new), raw.volume.map(Size::new), None)
    };

    Ok(OrderEvent {
        identifier: raw.identifier.map(ClientOrderId::from_string),
        exchange_uuid: raw.uuid,
        market,
        side: raw.ask_bid.as_deref().and_then(OrderSide::parse),
        kind: raw.order_type.as_deref().and_then(OrderKind::parse),
        status,
        price,
        avg_price: raw.avg_price.filter(|p| !p.is_zero()).map(Price::new),
        volume,
        remaining_volume: raw.remaining_volume.map(Size::new),
        executed_volume: raw.executed_volume.map(Size::new),
        trade,
        timestamp: raw
            .trade_timestamp
            .or(raw.order_timestamp)
            .or(raw.timestamp)
            .and_then(millis),
    })
}

fn market(code: &str) -> WsResult<MarketCode> {
    MarketCode::new(code).map_err(|e| WsError::ParseError(e.to_string()))
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
