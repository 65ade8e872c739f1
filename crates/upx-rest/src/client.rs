//! Typed endpoint client.
//!
//! Wraps the pipeline with one method per exchange endpoint and converts
//! wire responses into the normalized `upx-core` types.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use upx_core::{
    AssetBalance, ClientOrderId, ExchangeOrderStatus, MarketCode, OrderEvent, OrderKind,
    OrderRequest, OrderSide, Price, Size,
};

use crate::error::{RestError, RestResult};
use crate::nonce::{Clock, SystemClock};
use crate::pipeline::{Endpoint, RestPipeline};
use crate::query::QueryParams;

/// Page size of `GET /v1/orders/open`.
pub const OPEN_ORDERS_PAGE_LIMIT: usize = 100;
/// Upper bound on pages fetched in one open-orders snapshot.
const MAX_OPEN_ORDER_PAGES: u32 = 50;

/// Reference to one exchange order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderLookup {
    Uuid(String),
    Identifier(ClientOrderId),
}

impl OrderLookup {
    fn to_params(&self) -> QueryParams {
        match self {
            Self::Uuid(uuid) => QueryParams::new().with("uuid", uuid),
            Self::Identifier(id) => QueryParams::new().with("identifier", id),
        }
    }
}

impl std::fmt::Display for OrderLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uuid(uuid) => write!(f, "uuid:{uuid}"),
            Self::Identifier(id) => write!(f, "identifier:{id}"),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Execution entry inside an order response.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    pub uuid: String,
    pub price: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub funds: Option<Decimal>,
}

/// Order as returned by the order endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub uuid: String,
    pub side: String,
    pub ord_type: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub state: String,
    pub market: String,
    #[serde(default)]
    pub created_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub remaining_volume: Option<Decimal>,
    #[serde(default)]
    pub executed_volume: Option<Decimal>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub trades: Vec<TradeResponse>,
}

impl OrderResponse {
    /// Volume-weighted average of the listed executions.
    fn average_trade_price(&self) -> Option<Price> {
        let volume: Decimal = self.trades.iter().map(|t| t.volume).sum();
        if volume.is_zero() {
            return None;
        }
        let funds: Decimal = self
            .trades
            .iter()
            .map(|t| t.funds.unwrap_or(t.price * t.volume))
            .sum();
        Some(Price::new(funds / volume))
    }

    pub fn into_event(self) -> RestResult<OrderEvent> {
        let market = MarketCode::new(self.market.as_str())
            .map_err(|e| RestError::Decode(format!("order {}: {e}", self.uuid)))?;
        let avg_price = self.average_trade_price();

        Ok(OrderEvent {
            identifier: self.identifier.map(ClientOrderId::from_string),
            exchange_uuid: Some(self.uuid),
            market: Some(market),
            side: OrderSide::parse(&self.side),
            kind: OrderKind::parse(&self.ord_type),
            status: ExchangeOrderStatus::parse(&self.state),
            price: self.price.map(Price::new),
            avg_price,
            volume: self.volume.map(Size::new),
            remaining_volume: self.remaining_volume.map(Size::new),
            executed_volume: self.executed_volume.map(Size::new),
            trade: None,
            timestamp: self.created_at.map(|t| t.with_timezone(&Utc)),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AccountResponse {
    currency: String,
    balance: Decimal,
    locked: Decimal,
    #[serde(default)]
    avg_buy_price: Decimal,
}

impl From<AccountResponse> for AssetBalance {
    fn from(a: AccountResponse) -> Self {
        Self {
            currency: a.currency,
            balance: a.balance,
            locked: a.locked,
            avg_buy_price: a.avg_buy_price,
        }
    }
}

/// Listed market.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MarketInfo {
    pub market: String,
    #[serde(default)]
    pub korean_name: String,
    #[serde(default)]
    pub english_name: String,
}

/// Last trade snapshot of one market.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ticker {
    pub market: String,
    pub trade_price: Decimal,
    #[serde(default)]
    pub timestamp: i64,
}

// ============================================================================
// Client
// ============================================================================

/// One method per exchange endpoint.
pub struct ExchangeClient<C: Clock = SystemClock> {
    pipeline: Arc<RestPipeline<C>>,
}

impl<C: Clock> Clone for ExchangeClient<C> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<C: Clock> ExchangeClient<C> {
    pub fn new(pipeline: Arc<RestPipeline<C>>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &RestPipeline<C> {
        &self.pipeline
    }

    /// `GET /v1/accounts`
    pub async fn accounts(&self) -> RestResult<Vec<AssetBalance>> {
        let accounts: Vec<AccountResponse> = self
            .pipeline
            .call(&Endpoint::ACCOUNTS, &QueryParams::new())
            .await?;
        Ok(accounts.into_iter().map(AssetBalance::from).collect())
    }

    /// `GET /v1/market/all`
    pub async fn markets(&self) -> RestResult<Vec<MarketInfo>> {
        self.pipeline
            .call(&Endpoint::MARKETS, &QueryParams::new())
            .await
    }

    /// `GET /v1/ticker?markets=A,B`
    pub async fn ticker(&self, markets: &[MarketCode]) -> RestResult<Vec<Ticker>> {
        if markets.is_empty() {
            return Err(RestError::InvalidRequest("ticker needs at least one market".into()));
        }
        let codes = markets
            .iter()
            .map(MarketCode::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.pipeline
            .call(&Endpoint::TICKER, &QueryParams::new().with("markets", codes))
            .await
    }

    /// `POST /v1/orders`
    pub async fn place_order(
        &self,
        identifier: &ClientOrderId,
        request: &OrderRequest,
    ) -> RestResult<OrderEvent> {
        let params = QueryParams::new()
            .with("market", &request.market)
            .with("side", request.side)
            .with("ord_type", request.kind)
            .with_opt("volume", request.volume)
            .with_opt("price", request.price)
            .with("identifier", identifier);
        debug!(%identifier, market = %request.market, side = %request.side, "Placing order");

        let response: OrderResponse = self.pipeline.call(&Endpoint::PLACE_ORDER, &params).await?;
        let mut event = response.into_event()?;
        // The acknowledgement always refers to the identifier we sent.
        event.identifier.get_or_insert_with(|| identifier.clone());
        Ok(event)
    }

    /// `GET /v1/order`. A 404 maps to `Ok(None)`.
    pub async fn get_order(&self, lookup: &OrderLookup) -> RestResult<Option<OrderEvent>> {
        match self
            .pipeline
            .call::<OrderResponse>(&Endpoint::GET_ORDER, &lookup.to_params())
            .await
        {
            Ok(response) => response.into_event().map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `DELETE /v1/order`
    pub async fn cancel_order(&self, lookup: &OrderLookup) -> RestResult<OrderEvent> {
        let response: OrderResponse = self
            .pipeline
            .call(&Endpoint::CANCEL_ORDER, &lookup.to_params())
            .await?;
        response.into_event()
    }

    /// `GET /v1/orders/open`, every page.
    pub async fn open_orders(&self) -> RestResult<Vec<OrderEvent>> {
        let mut orders = Vec::new();
        for page in 1..=MAX_OPEN_ORDER_PAGES {
            let params = QueryParams::new()
                .with_array("states", ["wait", "watch"])
                .with("page", page)
                .with("limit", OPEN_ORDERS_PAGE_LIMIT);
            let batch: Vec<OrderResponse> =
                self.pipeline.call(&Endpoint::OPEN_ORDERS, &params).await?;
            let full_page = batch.len() >= OPEN_ORDERS_PAGE_LIMIT;
            for response in batch {
                orders.push(response.into_event()?);
            }
            if !full_page {
                break;
            }
        }
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ORDER_JSON: &str = r#"{
        "uuid": "9ca023a5-851b-4fec-9f0a-48cd83c2eaae",
        "side": "bid",
        "ord_type": "limit",
        "price": "4280000.0",
        "state": "done",
        "market": "KRW-BTC",
        "created_at": "2019-03-26T15:28:46+09:00",
        "volume": "1.0",
        "remaining_volume": "0.0",
        "executed_volume": "1.0",
        "identifier": "upx-1-1",
        "trades": [
            {"uuid": "t-1", "price": "4280000.0", "volume": "0.5", "funds": "2140000"},
            {"uuid": "t-2", "price": "4270000.0", "volume": "0.5", "funds": "2135000"}
        ]
    }"#;

    #[test]
    fn test_order_response_into_event() {
        let response: OrderResponse = serde_json::from_str(ORDER_JSON).unwrap();
        let event = response.into_event().unwrap();

        assert_eq!(event.identifier, Some(ClientOrderId::from_string("upx-1-1")));
        assert_eq!(event.status, ExchangeOrderStatus::Done);
        assert_eq!(event.side, Some(OrderSide::Bid));
        assert_eq!(event.kind, Some(OrderKind::Limit));
        assert_eq!(event.executed_volume, Some(Size::new(dec!(1.0))));
        assert_eq!(event.avg_price, Some(Price::new(dec!(4275000))));
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_order_response_without_trades_or_identifier() {
        let json = r#"{"uuid":"u","side":"ask","ord_type":"market","price":null,
            "state":"wait","market":"KRW-ETH","volume":"0.3","remaining_volume":"0.3",
            "executed_volume":"0"}"#;
        let event = serde_json::from_str::<OrderResponse>(json)
            .unwrap()
            .into_event()
            .unwrap();
        assert!(event.identifier.is_none());
        assert!(event.avg_price.is_none());
        assert!(event.price.is_none());
        assert_eq!(event.kind, Some(OrderKind::Market));
    }

    #[test]
    fn test_bad_market_is_decode_error() {
        let json = r#"{"uuid":"u","side":"bid","ord_type":"limit","state":"wait","market":"BTC"}"#;
        let err = serde_json::from_str::<OrderResponse>(json)
            .unwrap()
            .into_event()
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_lookup_params() {
        let by_id = OrderLookup::Identifier(ClientOrderId::from_string("upx-1-2"));
        assert_eq!(by_id.to_params().to_query_string(), "identifier=upx-1-2");
        assert_eq!(by_id.to_string(), "identifier:upx-1-2");
    }
}
