//! Timeout policy.
//!
//! When an order times out, the state machine asks a `TimeoutPolicy` what to
//! do with it. The policy sees an order snapshot and nothing else; retry
//! limits and cooldowns are enforced by the state machine around it.

use std::sync::Arc;

use rust_decimal::Decimal;
use upx_core::{Order, OrderKind, Price, Size};

/// What to do with a timed-out order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Cancel and resubmit the unfilled remainder unchanged.
    Retry,
    /// Cancel and stop.
    Cancel,
    /// Cancel and resubmit with a new volume and/or price.
    Amend {
        volume: Option<Size>,
        price: Option<Price>,
    },
    /// Hand the order to an operator.
    Escalate { reason: String },
}

impl TimeoutDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Cancel => "cancel",
            Self::Amend { .. } => "amend",
            Self::Escalate { .. } => "escalate",
        }
    }

    /// Decisions that submit a successor order.
    pub fn resubmits(&self) -> bool {
        matches!(self, Self::Retry | Self::Amend { .. })
    }
}

/// Decides the fate of a timed-out order.
pub trait TimeoutPolicy: Send + Sync {
    fn decide(&self, order: &Order) -> TimeoutDecision;
}

/// Arc wrapper for TimeoutPolicy trait objects.
pub type DynTimeoutPolicy = Arc<dyn TimeoutPolicy>;

/// Default policy.
///
/// - Nothing filled: retry as-is.
/// - Partially filled: amend to `remaining * reduce_ratio`.
/// - Remainder worth less than the minimum order: cancel.
#[derive(Debug, Clone)]
pub struct StandardTimeoutPolicy {
    pub reduce_ratio: Decimal,
    pub min_notional: Decimal,
}

impl StandardTimeoutPolicy {
    pub fn new(reduce_ratio: Decimal, min_notional: Decimal) -> Self {
        Self {
            reduce_ratio,
            min_notional,
        }
    }

    fn below_minimum(&self, volume: Size, price: Option<Price>) -> bool {
        match price {
            Some(price) => volume.notional(price) < self.min_notional,
            None => false,
        }
    }
}

impl Default for StandardTimeoutPolicy {
    fn default() -> Self {
        Self::new(Decimal::new(5, 1), Decimal::from(5000))
    }
}

impl TimeoutPolicy for StandardTimeoutPolicy {
    fn decide(&self, order: &Order) -> TimeoutDecision {
        // Quote-amount market buys carry no volume to size a remainder from.
        if order.kind == OrderKind::Price {
            return if order.filled.is_zero() {
                TimeoutDecision::Retry
            } else {
                TimeoutDecision::Cancel
            };
        }

        let Some(remaining) = order.remaining() else {
            return TimeoutDecision::Cancel;
        };
        let price = order.price.or(order.avg_fill_price);

        if order.filled.is_zero() {
            if self.below_minimum(remaining, price) {
                return TimeoutDecision::Cancel;
            }
            return TimeoutDecision::Retry;
        }

        let reduced = Size::new(remaining.inner() * self.reduce_ratio).truncate_to_exchange();
        if !reduced.is_positive() || self.below_minimum(reduced, price) {
            return TimeoutDecision::Cancel;
        }
        TimeoutDecision::Amend {
            volume: Some(reduced),
            price: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use upx_core::{ClientOrderId, MarketCode, OrderRequest, OrderSide};

    fn order(volume: Decimal, price: Decimal, filled: Decimal) -> Order {
        let request = OrderRequest::limit(
            MarketCode::new("KRW-XRP").unwrap(),
            OrderSide::Bid,
            Size::new(volume),
            Price::new(price),
        );
        let mut order = Order::accepted(
            ClientOrderId::from_string("upx-1-1"),
            &request,
            Some("u-1".into()),
            Utc::now(),
        );
        order.filled = Size::new(filled);
        order
    }

    #[test]
    fn test_unfilled_order_retries() {
        let policy = StandardTimeoutPolicy::default();
        assert_eq!(
            policy.decide(&order(dec!(100), dec!(1000), dec!(0))),
            TimeoutDecision::Retry
        );
    }

    #[test]
    fn test_partial_fill_amends_to_reduced_remainder() {
        let policy = StandardTimeoutPolicy::default();
        // 100 requested, 40 filled: remainder 60, halved to 30.
        assert_eq!(
            policy.decide(&order(dec!(100), dec!(1000), dec!(40))),
            TimeoutDecision::Amend {
                volume: Some(Size::new(dec!(30))),
                price: None,
            }
        );
    }

    #[test]
    fn test_small_remainder_cancels() {
        let policy = StandardTimeoutPolicy::default();
        // Remainder 8 halved to 4 at 1000 KRW = 4000 KRW, under the minimum.
        assert_eq!(
            policy.decide(&order(dec!(10), dec!(1000), dec!(2))),
            TimeoutDecision::Cancel
        );
        // Unfilled but the whole order is already too small.
        assert_eq!(
            policy.decide(&order(dec!(4), dec!(1000), dec!(0))),
            TimeoutDecision::Cancel
        );
    }

    #[test]
    fn test_resubmitting_decisions() {
        assert!(TimeoutDecision::Retry.resubmits());
        assert!(!TimeoutDecision::Cancel.resubmits());
        assert!(!TimeoutDecision::Escalate {
            reason: "x".into()
        }
        .resubmits());
    }
}
