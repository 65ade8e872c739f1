//! Normalized exchange updates.
//!
//! Both the streaming `myOrder`/`myAsset` frames and REST order/account
//! snapshots are converted into these types, so the order state machine and
//! reconciliation never see wire encodings.

use crate::decimal::{Price, Size};
use crate::market::MarketCode;
use crate::order::{ClientOrderId, OrderKind, OrderSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeOrderStatus {
    /// Resting, waiting for a match.
    Wait,
    /// Reserved (stop-limit) order waiting for its trigger.
    Watch,
    /// A trade executed against the order; the order may still be open.
    Trade,
    /// Fully executed.
    Done,
    /// Cancelled (possibly after partial execution).
    Cancel,
    /// Cancelled by self-trade prevention.
    Prevented,
    #[serde(other)]
    Unknown,
}

impl ExchangeOrderStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Self::Wait,
            "watch" => Self::Watch,
            "trade" => Self::Trade,
            "done" => Self::Done,
            "cancel" | "cancelled" => Self::Cancel,
            "prevented" => Self::Prevented,
            _ => Self::Unknown,
        }
    }

    /// Whether the exchange will not change this order any further.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Done | Self::Cancel | Self::Prevented)
    }
}

/// Single execution carried by a trade update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeFill {
    pub trade_id: String,
    pub price: Price,
    pub volume: Size,
}

/// Normalized order update (stream frame or REST snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub identifier: Option<ClientOrderId>,
    pub exchange_uuid: Option<String>,
    pub market: Option<MarketCode>,
    pub side: Option<OrderSide>,
    pub kind: Option<OrderKind>,
    pub status: ExchangeOrderStatus,
    /// Order price (limit price, or quote amount for `price` orders).
    pub price: Option<Price>,
    /// Average execution price reported by the exchange.
    pub avg_price: Option<Price>,
    /// Requested volume.
    pub volume: Option<Size>,
    pub remaining_volume: Option<Size>,
    /// Cumulative executed volume.
    pub executed_volume: Option<Size>,
    /// The execution this update reports, if it is a trade update.
    pub trade: Option<TradeFill>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderEvent {
    /// Minimal event carrying only a status, for snapshot-driven finalization.
    pub fn status_only(
        identifier: Option<ClientOrderId>,
        exchange_uuid: Option<String>,
        status: ExchangeOrderStatus,
    ) -> Self {
        Self {
            identifier,
            exchange_uuid,
            market: None,
            side: None,
            kind: None,
            status,
            price: None,
            avg_price: None,
            volume: None,
            remaining_volume: None,
            executed_volume: None,
            trade: None,
            timestamp: None,
        }
    }

    /// Cumulative executed volume, derived from remaining volume when absent.
    pub fn cumulative_filled(&self) -> Option<Size> {
        if let Some(executed) = self.executed_volume {
            return Some(executed);
        }
        match (self.requested_volume(), self.remaining_volume) {
            (Some(requested), Some(remaining)) => Some(requested.saturating_sub(remaining)),
            _ => None,
        }
    }

    /// Requested volume, derived from remaining + executed when absent.
    pub fn requested_volume(&self) -> Option<Size> {
        self.volume.or(match (self.remaining_volume, self.executed_volume) {
            (Some(remaining), Some(executed)) => Some(remaining + executed),
            _ => None,
        })
    }

    /// Key used for log correlation: identifier, else exchange uuid.
    pub fn correlation_key(&self) -> &str {
        self.identifier
            .as_ref()
            .map(ClientOrderId::as_str)
            .or(self.exchange_uuid.as_deref())
            .unwrap_or("<none>")
    }
}

/// Balance of one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub currency: String,
    pub balance: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Decimal,
}

impl AssetBalance {
    /// Free plus locked.
    pub fn total(&self) -> Decimal {
        self.balance + self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_parse() {
        assert_eq!(ExchangeOrderStatus::parse("wait"), ExchangeOrderStatus::Wait);
        assert_eq!(ExchangeOrderStatus::parse("DONE"), ExchangeOrderStatus::Done);
        assert_eq!(ExchangeOrderStatus::parse("cancelled"), ExchangeOrderStatus::Cancel);
        assert_eq!(ExchangeOrderStatus::parse("???"), ExchangeOrderStatus::Unknown);
        assert!(ExchangeOrderStatus::Prevented.is_final());
        assert!(!ExchangeOrderStatus::Trade.is_final());
    }

    #[test]
    fn test_cumulative_filled_derived_from_remaining() {
        let mut event = OrderEvent::status_only(None, Some("u-1".into()), ExchangeOrderStatus::Wait);
        event.volume = Some(Size::new(dec!(3)));
        event.remaining_volume = Some(Size::new(dec!(1.8)));
        assert_eq!(event.cumulative_filled(), Some(Size::new(dec!(1.2))));

        event.executed_volume = Some(Size::new(dec!(1.5)));
        assert_eq!(event.cumulative_filled(), Some(Size::new(dec!(1.5))));
    }

    #[test]
    fn test_requested_volume_derived_for_trade_updates() {
        let mut event = OrderEvent::status_only(None, None, ExchangeOrderStatus::Trade);
        event.remaining_volume = Some(Size::new(dec!(6)));
        event.executed_volume = Some(Size::new(dec!(4)));
        assert_eq!(event.requested_volume(), Some(Size::new(dec!(10))));
        assert_eq!(event.correlation_key(), "<none>");
    }
}
