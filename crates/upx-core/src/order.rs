//! Order intent types and client order identifiers.
//!
//! Provides the wire-level side and order kind, the client identifier with
//! its retry-lineage suffix, and the conversion from a strategy decision into
//! an exchange order request.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use crate::market::{krw_tick_size, MarketCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side as the exchange names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy.
    Bid,
    /// Sell.
    Ask,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }

    /// Parse the wire representation (`bid`/`ask`, also `B`/`A` in compact frames).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bid" | "BID" | "B" => Some(Self::Bid),
            "ask" | "ASK" | "A" => Some(Self::Ask),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange order type (`ord_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Limit order: volume + price.
    Limit,
    /// Market buy by quote amount: price carries the KRW to spend.
    Price,
    /// Market sell by volume.
    Market,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limit => "limit",
            Self::Price => "price",
            Self::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit" => Some(Self::Limit),
            "price" => Some(Self::Price),
            "market" => Some(Self::Market),
            _ => None,
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client order identifier sent as `identifier`.
///
/// Resubmissions keep the root and append `-r<n>`; the exchange rejects a
/// reused identifier, so an identifier is never issued twice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    const RETRY_MARKER: &'static str = "-r";

    /// Base identifier: `{prefix}-{epoch_ms}-{seq}`.
    pub fn base(prefix: &str, epoch_ms: i64, seq: u64) -> Self {
        Self(format!("{prefix}-{epoch_ms}-{seq}"))
    }

    /// Identifier for the `attempt`-th resubmission of `root`.
    pub fn retry_of(root: &ClientOrderId, attempt: u32) -> Self {
        Self(format!("{}{}{attempt}", root.0, Self::RETRY_MARKER))
    }

    /// Create from an existing string (exchange responses, adopted orders).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a resubmission identifier into its root and attempt number.
    ///
    /// Returns `None` for identifiers without a retry suffix.
    pub fn retry_parts(&self) -> Option<(ClientOrderId, u32)> {
        let idx = self.0.rfind(Self::RETRY_MARKER)?;
        let attempt: u32 = self.0[idx + Self::RETRY_MARKER.len()..].parse().ok()?;
        if idx == 0 {
            return None;
        }
        Some((Self(self.0[..idx].to_string()), attempt))
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Collaborator inputs
// ============================================================================

/// How much to trade, as decided by the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantity {
    /// Absolute volume in the base currency.
    Absolute(Size),
    /// Fraction of the held balance (asks) or of the sized notional (bids).
    Ratio(Decimal),
}

/// Price instruction from the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceInstruction {
    Limit(Price),
    Market,
}

/// Strategy decision handed to the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub side: OrderSide,
    pub market: MarketCode,
    pub quantity: Quantity,
    pub price: PriceInstruction,
}

/// Validated sizing from the risk collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    /// Quote-currency amount the risk layer approved.
    pub notional: Decimal,
    /// Stop reference price, carried for audit.
    pub stop_reference: Option<Price>,
}

// ============================================================================
// Order request
// ============================================================================

/// An order ready to be submitted, before it has an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market: MarketCode,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Volume for `Limit` and `Market` orders.
    pub volume: Option<Size>,
    /// Limit price, or quote amount for `Price` orders.
    pub price: Option<Price>,
    /// Stop reference from sizing, if any.
    pub stop_reference: Option<Price>,
}

impl OrderRequest {
    /// Limit order with the price rounded down to the market tick.
    pub fn limit(market: MarketCode, side: OrderSide, volume: Size, price: Price) -> Self {
        let price = round_price(&market, price);
        Self {
            market,
            side,
            kind: OrderKind::Limit,
            volume: Some(volume.truncate_to_exchange()),
            price: Some(price),
            stop_reference: None,
        }
    }

    /// Market buy spending `amount` of the quote currency.
    pub fn market_buy(market: MarketCode, amount: Decimal) -> Self {
        let amount = if market.is_krw() { amount.trunc() } else { amount };
        Self {
            market,
            side: OrderSide::Bid,
            kind: OrderKind::Price,
            volume: None,
            price: Some(Price::new(amount)),
            stop_reference: None,
        }
    }

    /// Market sell of `volume`.
    pub fn market_sell(market: MarketCode, volume: Size) -> Self {
        Self {
            market,
            side: OrderSide::Ask,
            kind: OrderKind::Market,
            volume: Some(volume.truncate_to_exchange()),
            price: None,
            stop_reference: None,
        }
    }

    /// Build a request from a strategy decision and risk sizing.
    ///
    /// `held` is the sellable balance of the base currency; `reference_price`
    /// is the last trade price used to convert between volume and notional.
    pub fn from_decision(
        decision: &Decision,
        sizing: &Sizing,
        held: Size,
        reference_price: Price,
    ) -> Result<Self> {
        if !reference_price.is_positive() {
            return Err(CoreError::InvalidOrder(format!(
                "reference price must be positive, got {reference_price}"
            )));
        }

        let mut request = match (decision.side, decision.price) {
            (OrderSide::Bid, PriceInstruction::Market) => {
                let amount = match decision.quantity {
                    Quantity::Absolute(volume) => volume.notional(reference_price),
                    Quantity::Ratio(ratio) => sizing.notional * ratio,
                };
                Self::market_buy(decision.market.clone(), amount.min(sizing.notional))
            }
            (OrderSide::Bid, PriceInstruction::Limit(price)) => {
                let price = round_price(&decision.market, price);
                if !price.is_positive() {
                    return Err(CoreError::InvalidOrder("limit price rounds to zero".into()));
                }
                let budget = match decision.quantity {
                    Quantity::Absolute(volume) => volume.notional(price).min(sizing.notional),
                    Quantity::Ratio(ratio) => sizing.notional * ratio,
                };
                Self::limit(
                    decision.market.clone(),
                    OrderSide::Bid,
                    Size::new(budget / price.inner()),
                    price,
                )
            }
            (OrderSide::Ask, price) => {
                let volume = match decision.quantity {
                    Quantity::Absolute(volume) => volume.min(held),
                    Quantity::Ratio(ratio) => held * ratio,
                };
                match price {
                    PriceInstruction::Market => {
                        Self::market_sell(decision.market.clone(), volume)
                    }
                    PriceInstruction::Limit(price) => {
                        Self::limit(decision.market.clone(), OrderSide::Ask, volume, price)
                    }
                }
            }
        };
        request.stop_reference = sizing.stop_reference;
        Ok(request)
    }

    /// Quote-currency notional of the request.
    pub fn notional(&self, reference_price: Option<Price>) -> Option<Decimal> {
        match self.kind {
            OrderKind::Limit => Some(self.volume?.notional(self.price?)),
            OrderKind::Price => self.price.map(|p| p.inner()),
            OrderKind::Market => Some(self.volume?.notional(reference_price?)),
        }
    }

    /// Pre-submission checks. Nothing that fails here is sent to the exchange.
    pub fn validate(&self, min_notional: Decimal, reference_price: Option<Price>) -> Result<()> {
        match self.kind {
            OrderKind::Limit => {
                let volume = self.volume.filter(Size::is_positive);
                let price = self.price.filter(Price::is_positive);
                if volume.is_none() || price.is_none() {
                    return Err(CoreError::InvalidOrder(
                        "limit order needs positive volume and price".into(),
                    ));
                }
            }
            OrderKind::Price => {
                if self.side != OrderSide::Bid || !self.price.is_some_and(|p| p.is_positive()) {
                    return Err(CoreError::InvalidOrder(
                        "price order must be a bid with a positive amount".into(),
                    ));
                }
            }
            OrderKind::Market => {
                if self.side != OrderSide::Ask || !self.volume.is_some_and(|v| v.is_positive()) {
                    return Err(CoreError::InvalidOrder(
                        "market order must be an ask with a positive volume".into(),
                    ));
                }
            }
        }

        if let Some(notional) = self.notional(reference_price) {
            if notional < min_notional {
                return Err(CoreError::InvalidOrder(format!(
                    "notional {notional} below minimum {min_notional}"
                )));
            }
        }
        Ok(())
    }
}

fn round_price(market: &MarketCode, price: Price) -> Price {
    if market.is_krw() {
        price.round_down_to_tick(krw_tick_size(price.inner()))
    } else {
        price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn krw_btc() -> MarketCode {
        MarketCode::new("KRW-BTC").unwrap()
    }

    #[test]
    fn test_side_parse_compact_and_verbose() {
        assert_eq!(OrderSide::parse("bid"), Some(OrderSide::Bid));
        assert_eq!(OrderSide::parse("A"), Some(OrderSide::Ask));
        assert_eq!(OrderSide::parse("x"), None);
    }

    #[test]
    fn test_retry_identifier_lineage() {
        let root = ClientOrderId::base("upx", 1_700_000_000_000, 7);
        assert_eq!(root.as_str(), "upx-1700000000000-7");
        assert!(root.retry_parts().is_none());

        let retry = ClientOrderId::retry_of(&root, 2);
        assert_eq!(retry.as_str(), "upx-1700000000000-7-r2");
        assert_eq!(retry.retry_parts(), Some((root, 2)));
    }

    #[test]
    fn test_limit_price_rounded_to_krw_tick() {
        for (reference, expected) in [
            (dec!(1000.4), dec!(1000)),
            (dec!(10000.9), dec!(10000)),
            (dec!(100049.9), dec!(100000)),
        ] {
            let req = OrderRequest::limit(krw_btc(), OrderSide::Bid, Size::new(dec!(1)), Price::new(reference));
            assert_eq!(req.price.unwrap().inner(), expected);
        }
    }

    #[test]
    fn test_validate_blocks_below_min_notional() {
        let req = OrderRequest::market_buy(krw_btc(), dec!(4999.9));
        assert!(req.validate(dec!(5000), None).is_err());

        let req = OrderRequest::market_sell(krw_btc(), Size::new(dec!(0.000000001)));
        assert!(req
            .validate(dec!(5000), Some(Price::new(dec!(100000))))
            .is_err());

        let req = OrderRequest::market_buy(krw_btc(), dec!(10000));
        assert!(req.validate(dec!(5000), None).is_ok());
    }

    #[test]
    fn test_from_decision_market_buy_uses_sizing_notional() {
        let decision = Decision {
            side: OrderSide::Bid,
            market: krw_btc(),
            quantity: Quantity::Ratio(dec!(1)),
            price: PriceInstruction::Market,
        };
        let sizing = Sizing {
            notional: dec!(20000),
            stop_reference: Some(Price::new(dec!(95000))),
        };
        let req =
            OrderRequest::from_decision(&decision, &sizing, Size::ZERO, Price::new(dec!(100000)))
                .unwrap();
        assert_eq!(req.kind, OrderKind::Price);
        assert_eq!(req.price, Some(Price::new(dec!(20000))));
        assert_eq!(req.stop_reference, Some(Price::new(dec!(95000))));
    }

    #[test]
    fn test_from_decision_ratio_sell_uses_held_balance() {
        let decision = Decision {
            side: OrderSide::Ask,
            market: krw_btc(),
            quantity: Quantity::Ratio(dec!(0.5)),
            price: PriceInstruction::Market,
        };
        let sizing = Sizing {
            notional: Decimal::ZERO,
            stop_reference: None,
        };
        let req = OrderRequest::from_decision(
            &decision,
            &sizing,
            Size::new(dec!(0.3)),
            Price::new(dec!(100000)),
        )
        .unwrap();
        assert_eq!(req.kind, OrderKind::Market);
        assert_eq!(req.volume, Some(Size::new(dec!(0.15))));
    }

    #[test]
    fn test_from_decision_limit_bid_converts_notional_to_volume() {
        let decision = Decision {
            side: OrderSide::Bid,
            market: krw_btc(),
            quantity: Quantity::Ratio(dec!(1)),
            price: PriceInstruction::Limit(Price::new(dec!(100049.9))),
        };
        let sizing = Sizing {
            notional: dec!(50000),
            stop_reference: None,
        };
        let req = OrderRequest::from_decision(
            &decision,
            &sizing,
            Size::ZERO,
            Price::new(dec!(100000)),
        )
        .unwrap();
        assert_eq!(req.price, Some(Price::new(dec!(100000))));
        assert_eq!(req.volume, Some(Size::new(dec!(0.5))));
    }
}
